use std::fs;

use tera::{Context, Tera};

use hhfab_definitions::{Vm, VmType};

use crate::workspace::VmDirs;
use crate::Result;

/// Well-known dev password hash for the default user (password `vlab`)
const PASSWORD_HASH: &str =
    "$6$vlab$8d3GsT0Cw9GdLmDZ8575ZYr4AjSFdNhxBkQ2tDGfxMP7nCpjsdDLXQrQkvXJfiCTTNHQZtqTC4y0jNqQ4ixGr0";

/// Butane source every server/external VM is ignited from
///
/// Kept simple on purpose: hostname, the default user, and the workspace
/// key. Externals additionally get their NIC plan dropped where the guest
/// tooling picks it up.
const BUTANE_TEMPLATE: &str = r#"variant: flatcar
version: 1.0.0
passwd:
  users:
    - name: core
      password_hash: "{{ password_hash }}"
      ssh_authorized_keys:
        - "{{ ssh_key }}"
storage:
  files:
    - path: /etc/hostname
      mode: 0644
      contents:
        inline: "{{ hostname }}"
{%- if external_plan %}
    - path: /etc/hhfab-external.yaml
      mode: 0644
      contents:
        inline: |
          {{ external_plan }}
{%- endif %}
"#;

/// VRF/NIC plan handed to an external VM
#[derive(Serialize, Clone, Debug, Default)]
pub struct ExternalPlan {
    pub vrfs: Vec<String>,
    pub nics: Vec<String>,
}

/// Render both the butane source and the translated ignition
///
/// Both land in the VM directory: the butane for humans debugging a boot,
/// the ignition for QEMU's fw_cfg (or the image build).
pub fn write(vm: &Vm, dirs: &VmDirs, ssh_key: &str, external: Option<&ExternalPlan>) -> Result<()> {
    let mut ctx = Context::new();
    ctx.insert("hostname", &vm.name);
    ctx.insert("password_hash", PASSWORD_HASH);
    ctx.insert("ssh_key", ssh_key);
    if vm.kind == VmType::External {
        let plan = external.cloned().unwrap_or_default();
        // pre-indent so the block scalar stays valid yaml
        let yaml = serde_yaml::to_string(&plan)?;
        let indented = yaml.trim_start_matches("---\n").trim_end().replace('\n', "\n          ");
        ctx.insert("external_plan", &indented);
    }
    let butane = Tera::one_off(BUTANE_TEMPLATE, &ctx, false)?;
    fs::write(dirs.butane(), &butane)?;

    let mut files = vec![json!({
        "path": "/etc/hostname",
        "mode": 420,
        "overwrite": true,
        "contents": { "source": format!("data:,{}", vm.name) },
    })];
    if vm.kind == VmType::External {
        let plan = external.cloned().unwrap_or_default();
        let inline = serde_yaml::to_string(&plan)?;
        files.push(json!({
            "path": "/etc/hhfab-external.yaml",
            "mode": 420,
            "overwrite": true,
            "contents": { "source": format!("data:,{}", urlencode(&inline)) },
        }));
    }

    let ignition = json!({
        "ignition": { "version": "3.3.0" },
        "passwd": {
            "users": [{
                "name": "core",
                "passwordHash": PASSWORD_HASH,
                "sshAuthorizedKeys": [ssh_key],
            }],
        },
        "storage": { "files": files },
    });
    fs::write(dirs.ignition(), serde_json::to_string_pretty(&ignition)?)?;
    debug!("Wrote butane and ignition for {}", vm.name);
    Ok(())
}

// data: urls only need the characters yaml actually emits covered
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' | '/' | ':' => out.push(c),
            ' ' => out.push_str("%20"),
            '\n' => out.push_str("%0A"),
            other => out.push_str(&format!("%{:02X}", other as u32)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use hhfab_definitions::vlab::{Nic, VmSize};
    use std::fs;

    fn scratch(kind: VmType) -> (Vm, VmDirs, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!("hhfab-ign-test-{}", uuid::Uuid::new_v4()));
        let ws = Workspace::new(&root);
        let vm = Vm {
            name: "server-01".into(),
            kind: kind.clone(),
            id: 8,
            size: VmSize::for_type(&kind),
            nics: vec![Nic::UserNet { sshPort: 22008, apiPort: None }],
        };
        let dirs = VmDirs::new(&ws, &vm.name);
        fs::create_dir_all(dirs.dir()).unwrap();
        (vm, dirs, root)
    }

    #[test]
    fn butane_and_ignition_written() {
        let (vm, dirs, root) = scratch(VmType::Server);
        write(&vm, &dirs, "ssh-ed25519 AAAA test", None).unwrap();

        let butane = fs::read_to_string(dirs.butane()).unwrap();
        assert!(butane.contains("name: core"));
        assert!(butane.contains("server-01"));
        assert!(butane.contains("ssh-ed25519 AAAA test"));
        assert!(!butane.contains("hhfab-external"));

        let ign: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dirs.ignition()).unwrap()).unwrap();
        assert_eq!(ign["ignition"]["version"], "3.3.0");
        assert_eq!(ign["passwd"]["users"][0]["name"], "core");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn external_carries_its_plan() {
        let (mut vm, dirs, root) = scratch(VmType::External);
        vm.kind = VmType::External;
        let plan = ExternalPlan { vrfs: vec!["vrf-01".into()], nics: vec!["enp2s1".into()] };
        write(&vm, &dirs, "key", Some(&plan)).unwrap();
        let butane = fs::read_to_string(dirs.butane()).unwrap();
        assert!(butane.contains("hhfab-external"));
        assert!(butane.contains("vrf-01"));
        let _ = fs::remove_dir_all(root);
    }
}
