//! Parsers for the `Key=Value;Key=Value` connection strings issued by the
//! cloud portal.

use std::{collections::HashMap, fmt};

use url::Url;

use super::error::ConfigLoadError;

fn pairs(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let mut split = part.splitn(2, '=');
            let key = split.next()?.trim().to_ascii_lowercase();
            let value = split.next()?.trim().to_string();
            Some((key, value))
        })
        .collect()
}

fn field(
    fields: &HashMap<String, String>,
    var: &'static str,
    name: &str,
) -> Result<String, ConfigLoadError> {
    fields
        .get(&name.to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| ConfigLoadError::InvalidConnectionString {
            var,
            reason: format!("missing `{name}`"),
        })
}

/// Namespace endpoint and shared access key for the message broker.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceBusConnection {
    /// `https://{namespace}.servicebus.windows.net/`
    pub endpoint: Url,
    pub key_name: String,
    pub key: String,
}

impl ServiceBusConnection {
    pub fn parse(var: &'static str, raw: &str) -> Result<Self, ConfigLoadError> {
        let fields = pairs(raw);
        let endpoint = field(&fields, var, "Endpoint")?;
        let parsed = Url::parse(&endpoint).map_err(|source| ConfigLoadError::InvalidUrl { var, source })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigLoadError::InvalidConnectionString {
                var,
                reason: "endpoint has no host".into(),
            })?;
        let endpoint = Url::parse(&format!("https://{host}/"))
            .map_err(|source| ConfigLoadError::InvalidUrl { var, source })?;

        Ok(Self {
            endpoint,
            key_name: field(&fields, var, "SharedAccessKeyName")?,
            key: field(&fields, var, "SharedAccessKey")?,
        })
    }
}

impl fmt::Debug for ServiceBusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusConnection")
            .field("endpoint", &self.endpoint.as_str())
            .field("key_name", &self.key_name)
            .field("key", &"***")
            .finish()
    }
}

/// Storage account credentials and the resolved blob service endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageConnection {
    pub account_name: String,
    /// Base64 account key as issued; decoded when signing.
    pub account_key: String,
    pub blob_endpoint: Url,
}

impl StorageConnection {
    pub fn parse(var: &'static str, raw: &str) -> Result<Self, ConfigLoadError> {
        let fields = pairs(raw);
        let account_name = field(&fields, var, "AccountName")?;
        let account_key = field(&fields, var, "AccountKey")?;

        let endpoint = match fields.get("blobendpoint").filter(|value| !value.is_empty()) {
            Some(explicit) => explicit.trim_end_matches('/').to_string(),
            None => {
                let protocol = fields
                    .get("defaultendpointsprotocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = fields
                    .get("endpointsuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{protocol}://{account_name}.blob.{suffix}")
            }
        };
        let blob_endpoint = Url::parse(&format!("{endpoint}/"))
            .map_err(|source| ConfigLoadError::InvalidUrl { var, source })?;

        Ok(Self {
            account_name,
            account_key,
            blob_endpoint,
        })
    }
}

impl fmt::Debug for StorageConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConnection")
            .field("account_name", &self.account_name)
            .field("account_key", &"***")
            .field("blob_endpoint", &self.blob_endpoint.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_bus_endpoint_is_rewritten_to_https() {
        let conn = ServiceBusConnection::parse(
            "SERVICE_BUS_CONNECTION_STRING",
            "Endpoint=sb://scans.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=abc+def/ghi=",
        )
        .expect("parse");

        assert_eq!(conn.endpoint.as_str(), "https://scans.servicebus.windows.net/");
        assert_eq!(conn.key_name, "RootManageSharedAccessKey");
        assert_eq!(conn.key, "abc+def/ghi=");
        assert!(!format!("{conn:?}").contains("abc+def"));
    }

    #[test]
    fn service_bus_requires_key() {
        let err = ServiceBusConnection::parse(
            "SERVICE_BUS_CONNECTION_STRING",
            "Endpoint=sb://scans.servicebus.windows.net/;SharedAccessKeyName=root",
        )
        .expect_err("missing key");
        assert!(err.to_string().contains("SharedAccessKey"), "{err}");
    }

    #[test]
    fn storage_endpoint_derives_from_account_and_suffix() {
        let conn = StorageConnection::parse(
            "BLOB_CONNECTION_STRING",
            "DefaultEndpointsProtocol=https;AccountName=uploads;AccountKey=a2V5;EndpointSuffix=core.windows.net",
        )
        .expect("parse");
        assert_eq!(conn.account_name, "uploads");
        assert_eq!(conn.account_key, "a2V5");
        assert_eq!(conn.blob_endpoint.as_str(), "https://uploads.blob.core.windows.net/");
    }

    #[test]
    fn storage_honours_explicit_blob_endpoint() {
        let conn = StorageConnection::parse(
            "BLOB_CONNECTION_STRING",
            "AccountName=devstoreaccount1;AccountKey=a2V5;BlobEndpoint=http://127.0.0.1:10000/devstoreaccount1",
        )
        .expect("parse");
        assert_eq!(
            conn.blob_endpoint.as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/"
        );
    }
}
