use url::Url;

use crate::{error::UserError, Result};

/// A parsed keyvault certificate reference of the shape
/// `https://<vault>.<suffix>/<type>/<name>[/<version>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVaultCertUri {
    pub vault_name: String,
    pub cert_name: String,
    pub object_version: Option<String>,
}

/// Parses a user-supplied keyvault certificate URI. Every deviation is a
/// user error; the message is safe to put in an event.
pub fn parse_keyvault_cert_uri(uri: &str) -> Result<KeyVaultCertUri> {
    let parsed = Url::parse(uri).map_err(|e| {
        UserError::new(
            format!("vault uri \"{uri}\" is not a valid URI"),
            format!("parsing vault uri {uri}: {e}"),
        )
    })?;

    if parsed.scheme() != "https" {
        return Err(UserError::from_msg(format!(
            "vault uri \"{uri}\" must use the https scheme"
        ))
        .into());
    }

    let host = parsed.host_str().unwrap_or_default();
    let Some((vault_name, rest)) = host.split_once('.') else {
        return Err(UserError::from_msg(format!(
            "vault uri \"{uri}\" has no vault name in its host"
        ))
        .into());
    };
    if vault_name.is_empty() || rest.is_empty() {
        return Err(UserError::from_msg(format!(
            "vault uri \"{uri}\" has no vault name in its host"
        ))
        .into());
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    let (cert_name, object_version) = match segments.as_slice() {
        [_, cert] => (cert.to_string(), None),
        [_, cert, version] => (cert.to_string(), Some(version.to_string())),
        _ => {
            return Err(UserError::from_msg(format!(
                "vault uri \"{uri}\" must have a path of the form /<type>/<name>[/<version>]"
            ))
            .into())
        }
    };

    Ok(KeyVaultCertUri {
        vault_name: vault_name.to_string(),
        cert_name,
        object_version,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_without_version() {
        let parsed =
            parse_keyvault_cert_uri("https://mykv.vault.azure.net/secrets/mycert").unwrap();
        assert_eq!(parsed.vault_name, "mykv");
        assert_eq!(parsed.cert_name, "mycert");
        assert_eq!(parsed.object_version, None);
    }

    #[test]
    fn parses_with_version() {
        let parsed =
            parse_keyvault_cert_uri("https://mykv.vault.azure.net/certificates/mycert/abc123")
                .unwrap();
        assert_eq!(parsed.vault_name, "mykv");
        assert_eq!(parsed.cert_name, "mycert");
        assert_eq!(parsed.object_version.as_deref(), Some("abc123"));
    }

    #[test]
    fn round_trips_well_formed_input() {
        for version in [None, Some("0123456789abcdef")] {
            let uri = match version {
                Some(v) => format!("https://vault.azure.example/secrets/cert/{v}"),
                None => "https://vault.azure.example/secrets/cert".to_string(),
            };
            let parsed = parse_keyvault_cert_uri(&uri).unwrap();
            assert_eq!(parsed.vault_name, "vault");
            assert_eq!(parsed.cert_name, "cert");
            assert_eq!(parsed.object_version.as_deref(), version);
        }
    }

    #[test]
    fn rejects_malformed_input_as_user_error() {
        for uri in [
            "not a uri",
            "http://mykv.vault.azure.net/secrets/mycert",
            "https://vaultwithoutdots/secrets/mycert",
            "https://mykv.vault.azure.net/secrets",
            "https://mykv.vault.azure.net/",
            "https://mykv.vault.azure.net/a/b/c/d",
        ] {
            let err = parse_keyvault_cert_uri(uri).unwrap_err();
            assert!(err.as_user_error().is_some(), "expected user error for {uri}");
        }
    }
}
