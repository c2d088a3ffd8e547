use std::fmt;

use url::Url;

use crate::Result;

/// The one verb set every PDU dialect understands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PduVerb {
    On,
    Off,
    Cycle,
}

impl fmt::Display for PduVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PduVerb::On => write!(f, "ON"),
            PduVerb::Off => write!(f, "OFF"),
            PduVerb::Cycle => write!(f, "CYCLE"),
        }
    }
}

/// A PDU outlet extracted from its annotation URL
#[derive(Debug, Clone, PartialEq)]
pub struct Outlet {
    pub ip: String,
    pub outlet: String,
}

/// Parse `scheme://host/path/{outletID}` into PDU IP and outlet id
pub fn parse_outlet_url(raw: &str) -> Result<Outlet> {
    let url = Url::parse(raw)?;
    let ip = url.host_str().ok_or_else(|| format!("outlet url {} has no host", raw))?.to_string();
    let outlet = url
        .path_segments()
        .and_then(|segs| segs.filter(|s| !s.is_empty()).last())
        .ok_or_else(|| format!("outlet url {} has no outlet id", raw))?
        .to_string();
    Ok(Outlet { ip, outlet })
}

/// PDU credentials, read by the top-level configuration loader
#[derive(Debug, Clone, Default)]
pub struct PduCreds {
    pub username: String,
    pub password: String,
}

impl PduCreds {
    /// `HHFAB_VLAB_PDU_USERNAME` / `HHFAB_VLAB_PDU_PASSWORD`
    pub fn from_env() -> Option<PduCreds> {
        use std::env;
        match (env::var("HHFAB_VLAB_PDU_USERNAME"), env::var("HHFAB_VLAB_PDU_PASSWORD")) {
            (Ok(username), Ok(password)) => Some(PduCreds { username, password }),
            _ => None,
        }
    }
}

/// Issue one verb against one outlet
///
/// Vendors multiplex this over their own HTTP dialects; the caller only
/// ever sees the uniform verb call.
pub fn power(outlet: &Outlet, verb: PduVerb, creds: &PduCreds) -> Result<()> {
    let url = format!("http://{}/outlet.csp", outlet.ip);
    debug!("PDU {} outlet {} on {}", verb, outlet.outlet, outlet.ip);
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()?;
    let res = client
        .post(&url)
        .basic_auth(&creds.username, Some(&creds.password))
        .form(&[("outlet", outlet.outlet.as_str()), ("op", &verb.to_string())])
        .send()?;
    if !res.status().is_success() {
        bail!("PDU {} on {} outlet {} returned {}", verb, outlet.ip, outlet.outlet, res.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outlet_url_split() {
        let o = parse_outlet_url("http://192.168.14.2/outlets/7").unwrap();
        assert_eq!(o.ip, "192.168.14.2");
        assert_eq!(o.outlet, "7");

        let o = parse_outlet_url("https://pdu-3.lab/api/v1/outlet/12/").unwrap();
        assert_eq!(o.ip, "pdu-3.lab");
        assert_eq!(o.outlet, "12");

        assert!(parse_outlet_url("not a url").is_err());
    }
}
