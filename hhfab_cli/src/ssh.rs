use std::fs;
use std::io::prelude::*;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hhfab_definitions::{VlabPlan, VmType, Wiring};

use crate::workspace::Workspace;
use crate::{ErrorKind, Result};

/// How to reach a target's ssh endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// NAT-forwarded loopback port on the host
    Direct { port: u16 },
    /// Management address reached by hopping through a control node
    Proxied { host: String, via_port: u16 },
}

/// Uniform ssh configuration for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub name: String,
    pub user: String,
    pub access: Access,
}

fn strip_bits(ip: &str) -> String {
    ip.splitn(2, '/').next().unwrap_or(ip).to_string()
}

/// Route a name to its ssh configuration
///
/// Control, server and external VMs are reached directly on their mapped
/// loopback port; switches as admin at their management IP and gateways as
/// core at theirs, both proxied through the first control VM.
pub fn target_for(plan: &VlabPlan, wiring: &Wiring, name: &str) -> Result<SshTarget> {
    if let Some(vm) = plan.get(name) {
        match vm.kind {
            VmType::Control | VmType::Server | VmType::External => {
                return Ok(SshTarget {
                    name: name.into(),
                    user: "core".into(),
                    access: Access::Direct { port: vm.ssh_port() },
                });
            }
            _ => {}
        }
    }

    let control = plan
        .controls()
        .first()
        .map(|vm| vm.ssh_port())
        .ok_or_else(|| ErrorKind::HostProvisioning("no control VM in the plan".into()))?;

    if let Some(sw) = wiring.switches.iter().find(|s| s.name == name) {
        let mgmt = sw
            .managementIP
            .as_ref()
            .ok_or_else(|| format!("switch {} has no management IP", name))?;
        return Ok(SshTarget {
            name: name.into(),
            user: "admin".into(),
            access: Access::Proxied { host: strip_bits(mgmt), via_port: control },
        });
    }
    if let Some(node) = wiring.fabNodes.iter().find(|n| n.name == name) {
        let mgmt = node
            .managementIP
            .as_ref()
            .ok_or_else(|| format!("node {} has no management IP", name))?;
        return Ok(SshTarget {
            name: name.into(),
            user: "core".into(),
            access: Access::Proxied { host: strip_bits(mgmt), via_port: control },
        });
    }
    bail!("nothing named {} to ssh to", name)
}

impl SshTarget {
    /// Argument list for the system ssh client
    pub fn command_args(&self, key: &Path) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            key.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        match &self.access {
            Access::Direct { port } => {
                args.push("-p".into());
                args.push(port.to_string());
                args.push(format!("{}@127.0.0.1", self.user));
            }
            Access::Proxied { host, via_port } => {
                args.push("-o".into());
                args.push(format!(
                    "ProxyCommand=ssh -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -W %h:%p -p {} core@127.0.0.1",
                    key.display(),
                    via_port
                ));
                args.push(format!("{}@{}", self.user, host));
            }
        }
        args
    }

    /// Run an interactive shell (or a command) via the system ssh client
    pub async fn interactive(&self, key: &Path, cmd: Option<Vec<String>>) -> Result<()> {
        let mut args = self.command_args(key);
        if let Some(c) = cmd {
            args.extend(c);
        }
        debug!("ssh {}", args.join(" "));
        let s = tokio::process::Command::new("ssh").args(&args).status().await?;
        if !s.success() {
            bail!("ssh to {} exited {}", self.name, s.code().unwrap_or(1001));
        }
        Ok(())
    }

    /// Run one command through the system ssh client, capturing output
    ///
    /// This is the path for proxied targets where a library session cannot
    /// hop through the control node.
    pub async fn exec_via_client(&self, key: &Path, cmd: &str) -> Result<String> {
        let mut args = self.command_args(key);
        args.push(cmd.to_string());
        debug!("ssh {}", args.join(" "));
        let out = tokio::process::Command::new("ssh").args(&args).output().await?;
        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("ssh {} '{}' exited {}: {}", self.name, cmd, out.status.code().unwrap_or(1001), stderr.trim());
        }
        Ok(stdout)
    }
}

// ---------------------------------------------------------------------------
// library sessions for direct targets

/// An authenticated session to a NAT-forwarded VM
pub struct Session {
    sess: ssh2::Session,
    target: String,
}

impl Session {
    /// Single connection attempt
    pub fn connect(target: &str, port: u16, user: &str, key: &Path) -> Result<Session> {
        let tcp = TcpStream::connect(("127.0.0.1", port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;
        let mut sess = ssh2::Session::new()?;
        sess.set_tcp_stream(tcp);
        sess.handshake()?;
        sess.userauth_pubkey_file(user, None, key, None)?;
        Ok(Session { sess, target: target.to_string() })
    }

    /// Retry until the endpoint authenticates or the deadline passes
    ///
    /// Samples the cancel flag between attempts so a group cancellation is
    /// prompt.
    pub fn wait_connect(
        target: &str,
        port: u16,
        user: &str,
        key: &Path,
        deadline: Duration,
        cancel: &AtomicBool,
    ) -> Result<Session> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            if cancel.load(Ordering::Relaxed) {
                bail!("cancelled while waiting for ssh on {}", target);
            }
            attempt += 1;
            match Session::connect(target, port, user, key) {
                Ok(s) => {
                    debug!("ssh to {} up after {} attempts", target, attempt);
                    return Ok(s);
                }
                Err(e) => {
                    trace!("ssh attempt {} to {}: {}", attempt, target, e);
                }
            }
            if started.elapsed() > deadline {
                return Err(ErrorKind::SshTimeout(target.into(), deadline.as_secs()).into());
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    /// Run a command, returning combined stdout and the exit code
    pub fn exec(&self, cmd: &str) -> Result<(String, i32)> {
        trace!("{}: {}", self.target, cmd);
        let mut ch = self.sess.channel_session()?;
        ch.exec(cmd)?;
        let mut out = String::new();
        ch.read_to_string(&mut out)?;
        let mut err = String::new();
        ch.stderr().read_to_string(&mut err)?;
        ch.wait_close()?;
        let code = ch.exit_status()?;
        if !err.trim().is_empty() {
            debug!("{}: {} stderr: {}", self.target, cmd, err.trim());
        }
        Ok((out, code))
    }

    /// Run a command, streaming each output line to a callback
    ///
    /// Used for long installers where the caller wants progress in the
    /// logs rather than one giant buffer at the end.
    pub fn exec_stream<F: FnMut(&str)>(&self, cmd: &str, mut on_line: F) -> Result<i32> {
        use std::io::BufRead;
        trace!("{}: {} (streaming)", self.target, cmd);
        let mut ch = self.sess.channel_session()?;
        // interleave stderr into the same stream; we only log it anyway
        ch.exec(&format!("{} 2>&1", cmd))?;
        {
            let reader = std::io::BufReader::new(&mut ch);
            for line in reader.lines() {
                match line {
                    Ok(l) => on_line(&l),
                    Err(_) => break,
                }
            }
        }
        ch.wait_close()?;
        Ok(ch.exit_status()?)
    }

    /// Run a command that must succeed
    pub fn exec_ok(&self, cmd: &str) -> Result<String> {
        let (out, code) = self.exec(cmd)?;
        if code != 0 {
            bail!("{} on {} exited {}", cmd, self.target, code);
        }
        Ok(out)
    }

    /// Upload a local file via scp
    pub fn upload(&self, local: &Path, remote: &str, mode: i32) -> Result<()> {
        let data = fs::read(local)?;
        self.upload_bytes(&data, remote, mode)
    }

    pub fn upload_bytes(&self, data: &[u8], remote: &str, mode: i32) -> Result<()> {
        debug!("{}: uploading {} bytes to {}", self.target, data.len(), remote);
        let mut ch = self.sess.scp_send(Path::new(remote), mode, data.len() as u64, None)?;
        ch.write_all(data)?;
        ch.send_eof()?;
        ch.wait_eof()?;
        ch.wait_close()?;
        Ok(())
    }

    /// Download a remote file via scp
    pub fn download(&self, remote: &str, local: &Path) -> Result<()> {
        debug!("{}: downloading {}", self.target, remote);
        let (mut ch, _stat) = self.sess.scp_recv(Path::new(remote))?;
        let mut data = vec![];
        ch.read_to_end(&mut data)?;
        fs::write(local, data)?;
        Ok(())
    }

    /// Read a small remote file, None if it does not exist
    pub fn read_file(&self, remote: &str) -> Result<Option<String>> {
        let (out, code) = self.exec(&format!("cat {} 2>/dev/null", remote))?;
        if code != 0 {
            return Ok(None);
        }
        Ok(Some(out))
    }
}

// ---------------------------------------------------------------------------
// key material

/// The vlab ssh keypair, created on first use
pub fn ensure_keypair(ws: &Workspace) -> Result<(PathBuf, String)> {
    let key = ws.vlab_dir().join("sshkey");
    if !key.is_file() {
        fs::create_dir_all(ws.vlab_dir())?;
        info!("Generating vlab ssh keypair");
        let s = std::process::Command::new("ssh-keygen")
            .args(&["-t", "ed25519", "-N", "", "-q", "-C", "hhfab-vlab", "-f"])
            .arg(&key)
            .status()?;
        if !s.success() {
            bail!("ssh-keygen failed: {}", s.code().unwrap_or(1001));
        }
    }
    let pubkey = fs::read_to_string(key.with_extension("pub"))?.trim().to_string();
    Ok((key, pubkey))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhfab_definitions::builder::{build, BuildOpts};
    use hhfab_definitions::hydrate::{hydrate, HydrateMode};
    use hhfab_definitions::vlab::plan;
    use hhfab_definitions::FabConfig;

    fn fixture() -> (VlabPlan, Wiring) {
        let cfg = FabConfig::default();
        let mut w = build(&cfg, &BuildOpts::default()).unwrap();
        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();
        let p = plan(&w, &[], "key").unwrap();
        (p, w)
    }

    #[test]
    fn control_is_direct() {
        let (p, w) = fixture();
        let t = target_for(&p, &w, "control-01").unwrap();
        assert_eq!(t.user, "core");
        assert_eq!(t.access, Access::Direct { port: 22000 });
    }

    #[test]
    fn switch_is_admin_proxied_through_control() {
        let (p, w) = fixture();
        let t = target_for(&p, &w, "leaf-01").unwrap();
        assert_eq!(t.user, "admin");
        match &t.access {
            Access::Proxied { host, via_port } => {
                assert!(host.starts_with("172.30.1."));
                assert!(!host.contains('/'));
                assert_eq!(*via_port, 22000);
            }
            a => panic!("unexpected access {:?}", a),
        }
        let args = t.command_args(Path::new("/tmp/key"));
        assert!(args.iter().any(|a| a.starts_with("ProxyCommand=ssh")));
        assert!(args.last().unwrap().starts_with("admin@"));
    }

    #[test]
    fn unknown_target_rejected() {
        let (p, w) = fixture();
        assert!(target_for(&p, &w, "leaf-99").is_err());
    }
}
