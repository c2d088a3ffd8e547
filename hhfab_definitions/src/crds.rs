#![allow(non_snake_case)]

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::wiring::{
    Connection, ControlNode, ExternalPeering, FabNode, Gateway, Ipv4Namespace, Named, Objects,
    Server, Switch, SwitchGroup, VlanNamespace, Vpc, VpcAttachment, VpcPeering, Wiring,
};
use crate::Result;

/// Basic CRD wrapper struct
///
/// The wiring YAML stream is a sequence of these, one document per object.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Crd<T> {
    pub apiVersion: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: T,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Metadata {
    pub name: String,
}

fn api_version(kind: &str) -> &'static str {
    match kind {
        "VPC" | "VPCAttachment" | "VPCPeering" | "ExternalPeering" => "vpc.hhfab.io/v1",
        "ControlNode" | "FabNode" | "Gateway" => "fabricator.hhfab.io/v1",
        _ => "wiring.hhfab.io/v1",
    }
}

impl<T: Named + Serialize> Crd<T> {
    pub fn wrap(obj: T) -> Crd<T> {
        let name = obj.object_name();
        Crd {
            apiVersion: api_version(T::KIND).into(),
            kind: T::KIND.into(),
            metadata: Metadata { name },
            spec: obj,
        }
    }
}

fn emit<T>(out: &mut String, objs: &[T]) -> Result<()>
where
    T: Named + Serialize + Clone,
{
    for o in objs {
        // serde_yaml prefixes each document with `---`, so plain
        // concatenation yields a valid stream
        out.push_str(&serde_yaml::to_string(&Crd::wrap(o.clone()))?);
        out.push('\n');
    }
    Ok(())
}

/// Serialize a store as a multi-document YAML stream, grouped by kind
pub fn to_yaml(w: &Wiring) -> Result<String> {
    let mut out = String::new();
    emit(&mut out, &w.vlanNamespaces)?;
    emit(&mut out, &w.ipv4Namespaces)?;
    emit(&mut out, &w.switchGroups)?;
    emit(&mut out, &w.switches)?;
    emit(&mut out, &w.servers)?;
    emit(&mut out, &w.connections)?;
    emit(&mut out, &w.controlNodes)?;
    emit(&mut out, &w.fabNodes)?;
    emit(&mut out, &w.gateways)?;
    emit(&mut out, &w.vpcs)?;
    emit(&mut out, &w.attachments)?;
    emit(&mut out, &w.peerings)?;
    emit(&mut out, &w.externalPeerings)?;
    Ok(out)
}

fn take<T>(w: &mut Wiring, doc: serde_yaml::Value) -> Result<()>
where
    T: Named + DeserializeOwned,
    Wiring: Objects<T>,
{
    let crd: Crd<T> = serde_yaml::from_value(doc)?;
    w.create(crd.spec)
}

/// Parse a multi-document YAML stream into an existing store
///
/// Documents are dispatched on their `kind`; unknown kinds are an error so
/// typos do not silently drop objects.
pub fn append_yaml(w: &mut Wiring, data: &str) -> Result<()> {
    for chunk in split_documents(data) {
        let doc: serde_yaml::Value = serde_yaml::from_str(&chunk)?;
        let kind = doc
            .as_mapping()
            .and_then(|m| m.get(&serde_yaml::Value::String("kind".into())))
            .and_then(|k| k.as_str())
            .map(String::from)
            .ok_or_else(|| format!("wiring document without a kind: {}", chunk.lines().next().unwrap_or("")))?;
        match kind.as_str() {
            "VLANNamespace" => take::<VlanNamespace>(w, doc)?,
            "IPv4Namespace" => take::<Ipv4Namespace>(w, doc)?,
            "SwitchGroup" => take::<SwitchGroup>(w, doc)?,
            "Switch" => take::<Switch>(w, doc)?,
            "Server" => take::<Server>(w, doc)?,
            "Connection" => take::<Connection>(w, doc)?,
            "ControlNode" => take::<ControlNode>(w, doc)?,
            "FabNode" => take::<FabNode>(w, doc)?,
            "Gateway" => take::<Gateway>(w, doc)?,
            "VPC" => take::<Vpc>(w, doc)?,
            "VPCAttachment" => take::<VpcAttachment>(w, doc)?,
            "VPCPeering" => take::<VpcPeering>(w, doc)?,
            "ExternalPeering" => take::<ExternalPeering>(w, doc)?,
            k => bail!("unknown wiring kind '{}'", k),
        }
    }
    Ok(())
}

// serde_yaml 0.8 only reads the first document of a stream, so split on
// document markers ourselves
fn split_documents(data: &str) -> Vec<String> {
    let mut docs = vec![];
    let mut cur = String::new();
    for line in data.lines() {
        if line.trim_end() == "---" {
            if !cur.trim().is_empty() {
                docs.push(cur.clone());
            }
            cur.clear();
            continue;
        }
        cur.push_str(line);
        cur.push('\n');
    }
    if !cur.trim().is_empty() {
        docs.push(cur);
    }
    docs
}

#[cfg(test)]
mod tests {
    use crate::wiring::{Objects, Server, Switch, Wiring};

    #[test]
    fn yaml_roundtrip() {
        let mut w = Wiring::new();
        w.create(Switch { name: "leaf-01".into(), ..Default::default() }).unwrap();
        w.create(Server { name: "server-01".into(), ..Default::default() }).unwrap();
        let y = w.to_yaml().unwrap();
        assert!(y.contains("kind: Switch"));
        assert!(y.contains("kind: Server"));

        let back = Wiring::from_yaml(&y).unwrap();
        assert_eq!(back.switches.len(), 1);
        assert_eq!(back.servers.len(), 1);
        assert_eq!(back.to_yaml().unwrap(), y);
    }

    #[test]
    fn unknown_kind_rejected() {
        let doc = "apiVersion: wiring.hhfab.io/v1\nkind: Widget\nmetadata:\n  name: x\nspec: {}\n";
        assert!(Wiring::from_yaml(doc).is_err());
    }

    #[test]
    fn duplicate_rejected() {
        let mut w = Wiring::new();
        w.create(Switch { name: "leaf-01".into(), ..Default::default() }).unwrap();
        assert!(w.create(Switch { name: "leaf-01".into(), ..Default::default() }).is_err());
    }
}
