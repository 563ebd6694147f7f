//! Container descriptors and the field accessor used by filters.

use serde::Deserialize;
use std::collections::HashMap;

/// Type URL containerd stores OCI runtime specs under.
pub const OCI_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

/// Label CRI puts on every container pointing at its pod sandbox.
pub const CRI_SANDBOX_ID_LABEL: &str = "io.kubernetes.cri.sandbox-id";

/// Everything the watcher knows about one container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    /// Runtime container id.
    pub id: String,
    /// Image reference.
    pub image: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Parsed OCI runtime spec, if the container carried one.
    pub spec: Option<RuntimeSpec>,
}

impl ContainerInfo {
    /// Hostname from the runtime spec, if set.
    pub fn hostname(&self) -> Option<&str> {
        self.spec
            .as_ref()
            .map(|s| s.hostname.as_str())
            .filter(|h| !h.is_empty())
    }

    /// Pod sandbox id for CRI-managed containers, else the container id.
    pub fn sandbox_id(&self) -> &str {
        self.labels
            .get(CRI_SANDBOX_ID_LABEL)
            .map(String::as_str)
            .unwrap_or(&self.id)
    }
}

/// The subset of the OCI runtime spec used for naming and filtering.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RuntimeSpec {
    /// Container hostname.
    #[serde(default)]
    pub hostname: String,
    /// Container domain name.
    #[serde(default)]
    pub domainname: String,
    /// Primary process settings.
    #[serde(default)]
    pub process: Option<ProcessSpec>,
}

/// Process section of the OCI spec.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProcessSpec {
    /// `KEY=VALUE` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Process user.
    #[serde(default)]
    pub user: UserSpec,
}

/// User the primary process runs as.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UserSpec {
    /// Numeric user id.
    #[serde(default)]
    pub uid: u32,
    /// Numeric group id.
    #[serde(default)]
    pub gid: u32,
    /// User name, only set on some platforms.
    #[serde(default)]
    pub username: Option<String>,
}

impl RuntimeSpec {
    /// Parse the JSON encoded spec stored alongside a container.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    fn env(&self) -> &[String] {
        self.process.as_ref().map(|p| p.env.as_slice()).unwrap_or(&[])
    }

    fn user(&self) -> Option<String> {
        let user = &self.process.as_ref()?.user;
        Some(match &user.username {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}:{}", user.uid, user.gid),
        })
    }
}

/// Read-only field lookup used by filter evaluation.
pub trait Adaptor {
    /// Return the value at `path`, or `None` when the field is absent.
    fn field(&self, path: &[&str]) -> Option<String>;
}

/// `Adaptor` over a [`ContainerInfo`].
///
/// Recognized paths:
/// - `id`
/// - `config.hostname`, `config.domainname`, `config.user`, `config.image`
/// - `config.env.<KEY>`
/// - `config.labels.<KEY>` (also `label.<KEY>` and `labels.<KEY>`)
///
/// Keys may contain dots; every segment after the namespace is part of the key.
pub struct ContainerAdaptor<'a> {
    container: &'a ContainerInfo,
}

impl<'a> ContainerAdaptor<'a> {
    /// Wrap a container.
    pub fn new(container: &'a ContainerInfo) -> Self {
        Self { container }
    }

    fn label(&self, key: &[&str]) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        self.container.labels.get(&key.join(".")).cloned()
    }

    fn env(&self, key: &[&str]) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        let key = key.join(".");
        let spec = self.container.spec.as_ref()?;
        spec.env().iter().find_map(|entry| match entry.split_once('=') {
            Some((k, v)) if k == key => Some(v.to_string()),
            None if *entry == key => Some(String::new()),
            _ => None,
        })
    }
}

impl Adaptor for ContainerAdaptor<'_> {
    fn field(&self, path: &[&str]) -> Option<String> {
        match path {
            ["id"] => Some(self.container.id.clone()),
            ["label" | "labels", key @ ..] => self.label(key),
            ["config", rest @ ..] => match rest {
                ["hostname"] => self.container.spec.as_ref().map(|s| s.hostname.clone()),
                ["domainname"] => self.container.spec.as_ref().map(|s| s.domainname.clone()),
                ["user"] => self.container.spec.as_ref().and_then(RuntimeSpec::user),
                ["image"] => Some(self.container.image.clone()),
                ["env", key @ ..] => self.env(key),
                ["labels", key @ ..] => self.label(key),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_container(env: &[&str]) -> ContainerInfo {
        ContainerInfo {
            id: "abc123".to_string(),
            image: "docker.io/library/nginx:1.27".to_string(),
            labels: HashMap::from([
                ("app".to_string(), "web".to_string()),
                ("io.kubernetes.pod.name".to_string(), "web-0".to_string()),
            ]),
            spec: Some(RuntimeSpec {
                hostname: "web".to_string(),
                domainname: "example".to_string(),
                process: Some(ProcessSpec {
                    env: env.iter().map(|e| e.to_string()).collect(),
                    user: UserSpec {
                        uid: 1000,
                        gid: 100,
                        username: None,
                    },
                }),
            }),
        }
    }

    #[test]
    fn test_env_value_is_found() {
        let container = make_container(&["PATH=/bin", "FOO=bar"]);
        let adaptor = ContainerAdaptor::new(&container);
        assert_eq!(
            adaptor.field(&["config", "env", "FOO"]),
            Some("bar".to_string())
        );
    }

    #[test]
    fn test_env_missing_key_is_absent() {
        let container = make_container(&["PATH=/bin"]);
        let adaptor = ContainerAdaptor::new(&container);
        assert_eq!(adaptor.field(&["config", "env", "FOO"]), None);
    }

    #[test]
    fn test_env_splits_on_first_equals() {
        let container = make_container(&["OPTS=a=b=c"]);
        let adaptor = ContainerAdaptor::new(&container);
        assert_eq!(
            adaptor.field(&["config", "env", "OPTS"]),
            Some("a=b=c".to_string())
        );
    }

    #[test]
    fn test_config_fields() {
        let container = make_container(&[]);
        let adaptor = ContainerAdaptor::new(&container);
        assert_eq!(adaptor.field(&["config", "hostname"]), Some("web".into()));
        assert_eq!(
            adaptor.field(&["config", "domainname"]),
            Some("example".into())
        );
        assert_eq!(adaptor.field(&["config", "user"]), Some("1000:100".into()));
        assert_eq!(
            adaptor.field(&["config", "image"]),
            Some("docker.io/library/nginx:1.27".into())
        );
    }

    #[test]
    fn test_dotted_label_key() {
        let container = make_container(&[]);
        let adaptor = ContainerAdaptor::new(&container);
        assert_eq!(
            adaptor.field(&["config", "labels", "io", "kubernetes", "pod", "name"]),
            Some("web-0".into())
        );
        assert_eq!(adaptor.field(&["label", "app"]), Some("web".into()));
    }

    #[test]
    fn test_unknown_or_malformed_paths_are_absent() {
        let container = make_container(&[]);
        let adaptor = ContainerAdaptor::new(&container);
        assert_eq!(adaptor.field(&[]), None);
        assert_eq!(adaptor.field(&["config"]), None);
        assert_eq!(adaptor.field(&["config", "env"]), None);
        assert_eq!(adaptor.field(&["config", "labels"]), None);
        assert_eq!(adaptor.field(&["config", "nope"]), None);
        assert_eq!(adaptor.field(&["docker", "label", "app"]), None);
    }

    #[test]
    fn test_missing_spec_hides_spec_fields() {
        let container = ContainerInfo {
            id: "x".into(),
            ..Default::default()
        };
        let adaptor = ContainerAdaptor::new(&container);
        assert_eq!(adaptor.field(&["config", "hostname"]), None);
        assert_eq!(adaptor.field(&["config", "env", "FOO"]), None);
        assert_eq!(container.hostname(), None);
    }

    #[test]
    fn test_runtime_spec_from_json() {
        let json = br#"{
            "ociVersion": "1.1.0",
            "hostname": "db",
            "process": {"user": {"uid": 0, "gid": 0}, "env": ["A=1"], "args": ["sh"]},
            "linux": {"namespaces": []}
        }"#;
        let spec = RuntimeSpec::from_json(json).unwrap();
        assert_eq!(spec.hostname, "db");
        assert_eq!(spec.env(), ["A=1".to_string()]);
    }

    #[test]
    fn test_sandbox_id_prefers_cri_label() {
        let mut container = make_container(&[]);
        assert_eq!(container.sandbox_id(), "abc123");
        container
            .labels
            .insert(CRI_SANDBOX_ID_LABEL.to_string(), "pod-sandbox".to_string());
        assert_eq!(container.sandbox_id(), "pod-sandbox");
    }
}
