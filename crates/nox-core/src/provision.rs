//! Provisioning Descriptor Builder.
//!
//! Renders the cloud-init NoCloud bundle for an instance: `user-data`,
//! `meta-data` and a netplan v2 `network-config`. Output depends only on the
//! inputs, so identical inputs produce byte-identical documents.

use crate::error::{CoreError, Result};
use crate::instance::{InstanceRecord, StaticAddress};
use crate::secret::{crypt_salt, Secret};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Account created in every guest.
pub const GUEST_USER: &str = "nox";

/// Where launch scripts are written inside the guest.
pub const GUEST_SCRIPT_DIR: &str = "/var/lib/nox/scripts";

/// A first-boot script resolved on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchScript {
    /// Short name used in the guest file name
    pub name: String,
    pub source: PathBuf,
    pub contents: String,
}

impl LaunchScript {
    /// Contents with a shebang guaranteed on the first line.
    fn body(&self) -> String {
        if self.contents.starts_with("#!") {
            self.contents.clone()
        } else {
            format!("#!/bin/sh\n{}", self.contents)
        }
    }
}

/// Resolve script references: a bare name is looked up as
/// `<scripts_dir>/<name>.sh`, anything else as a path.
pub fn resolve_scripts(refs: &[String], scripts_dir: &Path) -> Result<Vec<LaunchScript>> {
    refs.iter()
        .map(|r| {
            let r = r.trim();
            let builtin = scripts_dir.join(format!("{r}.sh"));
            let source = if !r.contains('/') && builtin.is_file() {
                builtin
            } else if Path::new(r).is_file() {
                PathBuf::from(r)
            } else {
                return Err(CoreError::Validation(format!(
                    "script not found: {r} (looked in {})",
                    scripts_dir.display()
                )));
            };
            let contents = std::fs::read_to_string(&source)?;
            let name = source
                .file_stem()
                .map(|s| sanitize(&s.to_string_lossy()))
                .unwrap_or_else(|| "script".into());
            Ok(LaunchScript {
                name,
                source,
                contents,
            })
        })
        .collect()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Everything the builder needs.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionInput<'a> {
    pub record: &'a InstanceRecord,
    pub ssh_public_key: &'a str,
    pub password: &'a Secret,
    pub env: &'a BTreeMap<String, String>,
    pub scripts: &'a [LaunchScript],
}

/// Rendered NoCloud documents.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisioningBundle {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

impl std::fmt::Debug for ProvisioningBundle {
    // user-data carries the password hash.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningBundle")
            .field("user_data", &format_args!("<{} bytes>", self.user_data.len()))
            .field("meta_data", &self.meta_data)
            .field("network_config", &self.network_config)
            .finish()
    }
}

impl ProvisioningBundle {
    /// `(file name, contents)` pairs for the seed volume.
    pub fn files(&self) -> [(&str, &str); 3] {
        [
            ("user-data", self.user_data.as_str()),
            ("meta-data", self.meta_data.as_str()),
            ("network-config", self.network_config.as_str()),
        ]
    }
}

#[derive(Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    manage_etc_hosts: bool,
    ssh_pwauth: bool,
    users: Vec<User<'a>>,
    chpasswd: Chpasswd<'a>,
    package_update: bool,
    packages: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<WriteFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    runcmd: Vec<Vec<String>>,
}

#[derive(Serialize)]
struct User<'a> {
    name: &'a str,
    shell: &'static str,
    sudo: &'static str,
    lock_passwd: bool,
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Serialize)]
struct Chpasswd<'a> {
    expire: bool,
    users: Vec<PasswordEntry<'a>>,
}

#[derive(Serialize)]
struct PasswordEntry<'a> {
    name: &'a str,
    password: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct WriteFile {
    path: String,
    permissions: &'static str,
    owner: &'static str,
    content: String,
}

#[derive(Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

#[derive(Serialize)]
struct NetworkConfig {
    version: u8,
    ethernets: BTreeMap<&'static str, Ethernet>,
}

#[derive(Serialize)]
struct Ethernet {
    #[serde(rename = "match")]
    matcher: MacMatch,
    dhcp4: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nameservers: Option<Nameservers>,
}

#[derive(Serialize)]
struct MacMatch {
    macaddress: String,
}

#[derive(Serialize)]
struct Route {
    to: &'static str,
    via: String,
}

#[derive(Serialize)]
struct Nameservers {
    addresses: Vec<String>,
}

fn packages(os: &str) -> Vec<&'static str> {
    match os {
        "alpine" => vec!["openssh", "sudo", "bash", "qemu-guest-agent"],
        _ => vec!["openssh-server", "sudo", "qemu-guest-agent"],
    }
}

fn shell(os: &str) -> &'static str {
    match os {
        "alpine" => "/bin/ash",
        _ => "/bin/bash",
    }
}

/// Render the bundle.
pub fn build(input: &ProvisionInput<'_>) -> Result<ProvisioningBundle> {
    let record = input.record;

    let mut write_files = Vec::new();
    if !input.env.is_empty() {
        let mut content = String::new();
        for (key, value) in input.env {
            if key.is_empty() || key.contains('=') || key.contains('\n') || value.contains('\n') {
                return Err(CoreError::Validation(format!(
                    "invalid environment entry: {key:?}"
                )));
            }
            content.push_str(&format!("{key}={value}\n"));
        }
        write_files.push(WriteFile {
            path: "/etc/environment".into(),
            permissions: "0644",
            owner: "root:root",
            content,
        });
    }

    let mut runcmd = Vec::new();
    for (idx, script) in input.scripts.iter().enumerate() {
        let path = format!("{GUEST_SCRIPT_DIR}/{:02}-{}.sh", idx + 1, script.name);
        write_files.push(WriteFile {
            path: path.clone(),
            permissions: "0755",
            owner: "root:root",
            content: script.body(),
        });
        runcmd.push(vec![path]);
    }

    let user_data = UserData {
        hostname: &record.name,
        manage_etc_hosts: true,
        ssh_pwauth: true,
        users: vec![User {
            name: GUEST_USER,
            shell: shell(&record.os),
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            lock_passwd: false,
            ssh_authorized_keys: vec![input.ssh_public_key.trim()],
        }],
        chpasswd: Chpasswd {
            expire: false,
            users: vec![PasswordEntry {
                name: GUEST_USER,
                password: input
                    .password
                    .sha512_crypt(&crypt_salt(record.id.as_bytes())),
                kind: "hash",
            }],
        },
        package_update: true,
        packages: packages(&record.os),
        write_files,
        runcmd,
    };

    let meta = MetaData {
        instance_id: record.id.to_string(),
        local_hostname: &record.name,
    };

    let network = NetworkConfig {
        version: 2,
        ethernets: BTreeMap::from([("primary", ethernet(&record.mac, record.static_address.as_ref()))]),
    };

    Ok(ProvisioningBundle {
        user_data: format!("#cloud-config\n{}", serde_yaml::to_string(&user_data)?),
        meta_data: serde_yaml::to_string(&meta)?,
        network_config: serde_yaml::to_string(&network)?,
    })
}

fn ethernet(mac: &str, address: Option<&StaticAddress>) -> Ethernet {
    let matcher = MacMatch {
        macaddress: mac.to_lowercase(),
    };
    match address {
        None => Ethernet {
            matcher,
            dhcp4: true,
            addresses: vec![],
            routes: vec![],
            nameservers: None,
        },
        Some(addr) => Ethernet {
            matcher,
            dhcp4: false,
            addresses: vec![addr.cidr()],
            routes: addr
                .gateway
                .map(|gw| Route {
                    to: "default",
                    via: gw.to_string(),
                })
                .into_iter()
                .collect(),
            nameservers: (!addr.nameservers.is_empty()).then(|| Nameservers {
                addresses: addr.nameservers.iter().map(|n| n.to_string()).collect(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::record;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBase nox";

    fn render(record: &InstanceRecord, scripts: &[LaunchScript]) -> ProvisioningBundle {
        let password = Secret::new("Passw0rdPassw0rd");
        let mut env = BTreeMap::new();
        env.insert("EDITOR".to_string(), "vim".to_string());
        env.insert("API_URL".to_string(), "https://example.test".to_string());
        build(&ProvisionInput {
            record,
            ssh_public_key: KEY,
            password: &password,
            env: &env,
            scripts,
        })
        .unwrap()
    }

    #[test]
    fn test_deterministic() {
        let rec = record("vm1");
        let scripts = vec![LaunchScript {
            name: "docker".into(),
            source: PathBuf::from("/x/docker.sh"),
            contents: "#!/bin/bash\napt-get install -y docker.io\n".into(),
        }];
        assert_eq!(render(&rec, &scripts), render(&rec, &scripts));
    }

    #[test]
    fn test_user_data_contents() {
        let rec = record("vm1");
        let bundle = render(&rec, &[]);
        assert!(bundle.user_data.starts_with("#cloud-config\n"));

        let doc: serde_yaml::Value = serde_yaml::from_str(&bundle.user_data).unwrap();
        assert_eq!(doc["hostname"].as_str(), Some("vm1"));
        let user = &doc["users"][0];
        assert_eq!(user["name"].as_str(), Some("nox"));
        assert_eq!(user["sudo"].as_str(), Some("ALL=(ALL) NOPASSWD:ALL"));
        let keys = user["ssh_authorized_keys"].as_sequence().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_str(), Some(KEY));
        let entry = &doc["chpasswd"]["users"][0];
        assert_eq!(entry["type"].as_str(), Some("hash"));
        let salt = crypt_salt(rec.id.as_bytes());
        assert_eq!(
            entry["password"].as_str(),
            Some(Secret::new("Passw0rdPassw0rd").sha512_crypt(&salt).as_str())
        );
        assert!(!bundle.user_data.contains("Passw0rdPassw0rd"));

        let env = doc["write_files"][0]["content"].as_str().unwrap();
        assert_eq!(env, "API_URL=https://example.test\nEDITOR=vim\n");
        assert!(doc.get("runcmd").is_none());
    }

    #[test]
    fn test_scripts_written_and_ordered() {
        let rec = record("vm1");
        let scripts = vec![
            LaunchScript {
                name: "docker".into(),
                source: PathBuf::from("/s/docker.sh"),
                contents: "#!/bin/bash\necho docker\n".into(),
            },
            LaunchScript {
                name: "tailscale".into(),
                source: PathBuf::from("/s/tailscale.sh"),
                contents: "echo ts\n".into(),
            },
        ];
        let bundle = render(&rec, &scripts);
        let doc: serde_yaml::Value = serde_yaml::from_str(&bundle.user_data).unwrap();

        let runcmd = doc["runcmd"].as_sequence().unwrap();
        assert_eq!(runcmd[0][0].as_str(), Some("/var/lib/nox/scripts/01-docker.sh"));
        assert_eq!(runcmd[1][0].as_str(), Some("/var/lib/nox/scripts/02-tailscale.sh"));

        let files = doc["write_files"].as_sequence().unwrap();
        assert_eq!(files[1]["content"].as_str(), Some("#!/bin/bash\necho docker\n"));
        assert_eq!(files[2]["content"].as_str(), Some("#!/bin/sh\necho ts\n"));
        assert_eq!(files[2]["permissions"].as_str(), Some("0755"));
    }

    #[test]
    fn test_meta_data() {
        let rec = record("vm1");
        let bundle = render(&rec, &[]);
        let doc: serde_yaml::Value = serde_yaml::from_str(&bundle.meta_data).unwrap();
        assert_eq!(doc["instance-id"].as_str(), Some(rec.id.to_string().as_str()));
        assert_eq!(doc["local-hostname"].as_str(), Some("vm1"));
    }

    #[test]
    fn test_network_dhcp_and_static() {
        let mut rec = record("vm1");
        rec.mac = "52:54:00:AA:BB:CC".into();
        let dhcp: serde_yaml::Value =
            serde_yaml::from_str(&render(&rec, &[]).network_config).unwrap();
        let eth = &dhcp["ethernets"]["primary"];
        assert_eq!(eth["dhcp4"].as_bool(), Some(true));
        assert_eq!(eth["match"]["macaddress"].as_str(), Some("52:54:00:aa:bb:cc"));
        assert!(eth.get("addresses").is_none());

        rec.static_address = Some(StaticAddress::parse_cidr("192.168.1.50/24").unwrap());
        let fixed: serde_yaml::Value =
            serde_yaml::from_str(&render(&rec, &[]).network_config).unwrap();
        let eth = &fixed["ethernets"]["primary"];
        assert_eq!(eth["dhcp4"].as_bool(), Some(false));
        assert_eq!(eth["addresses"][0].as_str(), Some("192.168.1.50/24"));
        assert_eq!(eth["routes"][0]["via"].as_str(), Some("192.168.1.1"));
    }

    #[test]
    fn test_bundle_debug_hides_user_data() {
        let bundle = render(&record("vm1"), &[]);
        let debug = format!("{bundle:?}");
        assert!(!debug.contains("Passw0rd"));
    }

    #[test]
    fn test_resolve_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docker.sh"), "#!/bin/sh\necho hi\n").unwrap();
        let custom = dir.path().join("custom setup.sh");
        std::fs::write(&custom, "echo custom\n").unwrap();

        let scripts = resolve_scripts(
            &["docker".to_string(), custom.to_string_lossy().to_string()],
            dir.path(),
        )
        .unwrap();
        assert_eq!(scripts[0].name, "docker");
        assert_eq!(scripts[1].name, "custom_setup");

        let err = resolve_scripts(&["missing".to_string()], dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_rejects_bad_env() {
        let rec = record("vm1");
        let password = Secret::new("x");
        let mut env = BTreeMap::new();
        env.insert("A=B".to_string(), "c".to_string());
        let result = build(&ProvisionInput {
            record: &rec,
            ssh_public_key: KEY,
            password: &password,
            env: &env,
            scripts: &[],
        });
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }
}
