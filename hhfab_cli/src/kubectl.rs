use std::path::Path;

use serde::Serialize;
use tokio::process::Command;

use hhfab_definitions::wiring::Named;
use hhfab_definitions::Crd;

use crate::Result;

pub async fn kexec(kubeconfig: &Path, args: Vec<String>) -> Result<()> {
    debug!("kubectl {}", args.join(" "));
    let s = Command::new("kubectl")
        .arg(format!("--kubeconfig={}", kubeconfig.display()))
        .args(&args)
        .status()
        .await?;
    if !s.success() {
        bail!("Subprocess failure from kubectl: {}", s.code().unwrap_or(1001))
    }
    Ok(())
}

async fn kout(kubeconfig: &Path, args: Vec<String>) -> Result<(String, bool)> {
    debug!("kubectl {}", args.join(" "));
    let s = Command::new("kubectl")
        .arg(format!("--kubeconfig={}", kubeconfig.display()))
        .args(&args)
        .output()
        .await?;
    let out: String = String::from_utf8_lossy(&s.stdout).into();
    let err: String = String::from_utf8_lossy(&s.stderr).to_string().trim().into();
    if !err.is_empty() {
        debug!("kubectl {} stderr: {}", args.join(" "), err);
    }
    Ok((out, s.status.success()))
}

/// Apply one wrapped fabric object via kubectl apply
///
/// Returns whether the object was created or configured (false when the
/// server found it unchanged).
pub async fn apply_resource<T: Named + Serialize>(
    kubeconfig: &Path,
    ns: &str,
    obj: T,
) -> Result<bool> {
    use std::fs::{self, File};
    use std::io::Write;

    let crd = Crd::wrap(obj);
    let datafile = format!("{}.{}.gen.yml", crd.metadata.name, T::KIND.to_lowercase());
    let pth = Path::new(".").join(&datafile);
    debug!("Writing {} {} to {}", T::KIND, crd.metadata.name, pth.display());
    let mut f = File::create(&pth)?;
    writeln!(f, "{}", serde_yaml::to_string(&crd)?)?;

    let applyargs = vec![format!("-n={}", ns), "apply".into(), "-f".into(), datafile.clone()];
    let (out, status) = kout(kubeconfig, applyargs.clone()).await?;
    print!("{}", out); // always print kube output from this
    if !status {
        bail!("subprocess failure from kubectl: {:?}", applyargs);
    }
    let changed = if out.contains("configured") || out.contains("created") {
        true
    } else if out.contains("unchanged") {
        false
    } else {
        bail!("unrecognized apply result: {}", out)
    };
    let _ = fs::remove_file(&datafile);
    Ok(changed)
}

/// Delete one fabric object, tolerating absence
pub async fn delete_resource(kubeconfig: &Path, ns: &str, kind: &str, name: &str) -> Result<()> {
    let args = vec![
        format!("-n={}", ns),
        "delete".into(),
        kind.to_lowercase(),
        name.into(),
        "--ignore-not-found".into(),
    ];
    let (_, status) = kout(kubeconfig, args.clone()).await?;
    if !status {
        bail!("subprocess failure from kubectl: {:?}", args);
    }
    Ok(())
}

/// Does a named resource of a kind exist yet?
pub async fn resource_exists(kubeconfig: &Path, ns: &str, kind: &str, name: &str) -> Result<bool> {
    let args = vec![format!("-n={}", ns), "get".into(), kind.into(), name.into(), "-oname".into()];
    let (out, status) = kout(kubeconfig, args).await?;
    Ok(status && !out.trim().is_empty())
}

/// Names of all objects of a kind in a namespace
pub async fn list_names(kubeconfig: &Path, ns: &str, kind: &str) -> Result<Vec<String>> {
    let args = vec![
        format!("-n={}", ns),
        "get".into(),
        kind.into(),
        "-ojsonpath={.items[*].metadata.name}".into(),
    ];
    let (out, status) = kout(kubeconfig, args).await?;
    if !status {
        bail!("failed to list {} in {}", kind, ns);
    }
    Ok(out.split_whitespace().map(String::from).collect())
}
