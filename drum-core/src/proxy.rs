use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Socks5,
    #[default]
    Http,
}

impl ProxyType {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyType::Socks5 => "socks5",
            ProxyType::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Unknown,
    Alive,
    Dead,
}

/// Shared observed-health cell: the upstream client flips it around
/// every request while the account keeps serializing the latest value.
#[derive(Debug, Clone, Default)]
pub struct ProxyStatusCell(Arc<Mutex<ProxyStatus>>);

impl ProxyStatusCell {
    pub fn get(&self) -> ProxyStatus {
        *self.0.lock().unwrap()
    }

    pub fn set(&self, status: ProxyStatus) {
        *self.0.lock().unwrap() = status;
    }
}

impl Serialize for ProxyStatusCell {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProxyStatusCell {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let status = ProxyStatus::deserialize(deserializer)?;
        Ok(Self(Arc::new(Mutex::new(status))))
    }
}

/// Per-account upstream egress descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    #[serde(default = "crate::account::short_uid")]
    pub uid: String,

    #[serde(default, rename = "type")]
    pub proxy_type: ProxyType,

    pub host: String,
    pub port: u16,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub status: ProxyStatusCell,
}

impl Proxy {
    /// Proxy URL with optional userinfo, e.g. `socks5://u:p@host:1080`.
    pub fn url(&self) -> String {
        let auth = match (&self.user, &self.password) {
            (Some(user), Some(password)) => format!("{user}:{password}@"),
            (Some(user), None) => format!("{user}@"),
            _ => String::new(),
        };
        format!("{}://{}{}:{}", self.proxy_type.scheme(), auth, self.host, self.port)
    }

    pub fn is_alive(&self) -> bool {
        self.status.get() == ProxyStatus::Alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(proxy_type: ProxyType, user: Option<&str>, password: Option<&str>) -> Proxy {
        Proxy {
            uid: "abcd1234".into(),
            proxy_type,
            host: "10.0.0.2".into(),
            port: 1080,
            user: user.map(Into::into),
            password: password.map(Into::into),
            status: ProxyStatusCell::default(),
        }
    }

    #[test]
    fn url_without_auth() {
        assert_eq!(
            proxy(ProxyType::Http, None, None).url(),
            "http://10.0.0.2:1080"
        );
    }

    #[test]
    fn url_with_auth() {
        assert_eq!(
            proxy(ProxyType::Socks5, Some("u"), Some("p")).url(),
            "socks5://u:p@10.0.0.2:1080"
        );
    }

    #[test]
    fn status_cell_is_shared_across_clones() {
        let p = proxy(ProxyType::Http, None, None);
        let clone = p.clone();
        p.status.set(ProxyStatus::Alive);
        assert!(clone.is_alive());
    }

    #[test]
    fn deserializes_with_defaults() {
        let p: Proxy = serde_json::from_str(r#"{"host":"h","port":8080}"#).unwrap();
        assert_eq!(p.proxy_type, ProxyType::Http);
        assert_eq!(p.status.get(), ProxyStatus::Unknown);
        assert_eq!(p.uid.len(), 8);
    }
}
