use crate::{error::UserError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    Public,
    Private,
}

/// One parsed DNS zone resource id of the shape
/// `/subscriptions/<sub>/resourceGroups/<rg>/providers/Microsoft.Network/{dnszones|privatednszones}/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsZoneResourceId {
    pub subscription: String,
    pub resource_group: String,
    pub kind: ZoneKind,
    pub zone_name: String,
}

/// A homogeneous group of zones: one subscription, one resource group, one
/// kind. Heterogeneous input fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsZoneConfig {
    pub subscription: String,
    pub resource_group: String,
    pub kind: ZoneKind,
    pub zone_names: Vec<String>,
}

pub fn parse_zone_resource_id(id: &str) -> Result<DnsZoneResourceId> {
    let fail = |dev: String| -> crate::error::ControllerError {
        UserError::new(
            format!("invalid DNS zone resource id \"{id}\""),
            dev,
        )
        .into()
    };

    let parts: Vec<&str> = id.split('/').collect();
    // Leading slash yields an empty first element.
    if parts.len() != 9 || !parts[0].is_empty() {
        return Err(fail(format!("expected 8 segments, got {}", parts.len() - 1)));
    }
    if !parts[1].eq_ignore_ascii_case("subscriptions")
        || !parts[3].eq_ignore_ascii_case("resourcegroups")
        || !parts[5].eq_ignore_ascii_case("providers")
        || !parts[6].eq_ignore_ascii_case("microsoft.network")
    {
        return Err(fail("fixed segments do not match".to_string()));
    }
    let kind = if parts[7].eq_ignore_ascii_case("dnszones") {
        ZoneKind::Public
    } else if parts[7].eq_ignore_ascii_case("privatednszones") {
        ZoneKind::Private
    } else {
        return Err(fail(format!("unsupported resource type \"{}\"", parts[7])));
    };
    let (subscription, resource_group, zone_name) = (parts[2], parts[4], parts[8]);
    if subscription.is_empty() || resource_group.is_empty() || zone_name.is_empty() {
        return Err(fail("empty subscription, resource group, or zone name".to_string()));
    }

    Ok(DnsZoneResourceId {
        subscription: subscription.to_string(),
        resource_group: resource_group.to_string(),
        kind,
        zone_name: zone_name.to_string(),
    })
}

impl DnsZoneConfig {
    pub fn from_ids(ids: &[String]) -> Result<Self> {
        if ids.is_empty() || ids.len() > 7 {
            return Err(UserError::from_msg(format!(
                "between 1 and 7 DNS zone resource ids are supported, got {}",
                ids.len()
            ))
            .into());
        }
        let parsed = ids
            .iter()
            .map(|id| parse_zone_resource_id(id))
            .collect::<Result<Vec<_>>>()?;
        let first = &parsed[0];
        for zone in &parsed[1..] {
            if zone.subscription != first.subscription {
                return Err(UserError::from_msg(
                    "all DNS zone resource ids must share one subscription",
                )
                .into());
            }
            if zone.resource_group != first.resource_group {
                return Err(UserError::from_msg(
                    "all DNS zone resource ids must share one resource group",
                )
                .into());
            }
            if zone.kind != first.kind {
                return Err(UserError::from_msg(
                    "public and private DNS zones cannot be mixed in one instance",
                )
                .into());
            }
        }
        Ok(Self {
            subscription: first.subscription.clone(),
            resource_group: first.resource_group.clone(),
            kind: first.kind,
            zone_names: parsed.into_iter().map(|z| z.zone_name).collect(),
        })
    }
}

/// Splits a mixed id list into at most one public and one private group.
/// Used for the config-driven instances, where both kinds may be given.
pub fn partition_zones(ids: &[String]) -> Result<Vec<DnsZoneConfig>> {
    let mut public = Vec::new();
    let mut private = Vec::new();
    for id in ids {
        match parse_zone_resource_id(id)?.kind {
            ZoneKind::Public => public.push(id.clone()),
            ZoneKind::Private => private.push(id.clone()),
        }
    }
    let mut configs = Vec::new();
    for group in [public, private] {
        if !group.is_empty() {
            configs.push(DnsZoneConfig::from_ids(&group)?);
        }
    }
    Ok(configs)
}

#[cfg(test)]
mod test {
    use super::*;

    fn zone_id(sub: &str, rg: &str, kind: &str, name: &str) -> String {
        format!("/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Network/{kind}/{name}")
    }

    #[test]
    fn parses_public_and_private_zones() {
        let public = parse_zone_resource_id(&zone_id("s1", "rg1", "dnszones", "example.com")).unwrap();
        assert_eq!(public.kind, ZoneKind::Public);
        assert_eq!(public.subscription, "s1");
        assert_eq!(public.resource_group, "rg1");
        assert_eq!(public.zone_name, "example.com");

        let private =
            parse_zone_resource_id(&zone_id("s1", "rg1", "privateDnsZones", "internal.example.com"))
                .unwrap();
        assert_eq!(private.kind, ZoneKind::Private);
    }

    #[test]
    fn rejects_other_resource_types() {
        let err = parse_zone_resource_id(&zone_id("s1", "rg1", "trafficmanagerprofiles", "x"))
            .unwrap_err();
        assert!(err.as_user_error().is_some());
    }

    #[test]
    fn rejects_malformed_ids() {
        for id in [
            "",
            "/subscriptions/s1",
            "subscriptions/s1/resourceGroups/rg/providers/Microsoft.Network/dnszones/z",
            "/subscriptions//resourceGroups/rg/providers/Microsoft.Network/dnszones/z",
        ] {
            assert!(parse_zone_resource_id(id).is_err(), "expected failure for {id:?}");
        }
    }

    #[test]
    fn config_requires_homogeneous_groups() {
        let mixed_sub = [
            zone_id("s1", "rg1", "dnszones", "a.com"),
            zone_id("s2", "rg1", "dnszones", "b.com"),
        ];
        assert!(DnsZoneConfig::from_ids(&mixed_sub).is_err());

        let mixed_rg = [
            zone_id("s1", "rg1", "dnszones", "a.com"),
            zone_id("s1", "rg2", "dnszones", "b.com"),
        ];
        assert!(DnsZoneConfig::from_ids(&mixed_rg).is_err());

        let mixed_kind = [
            zone_id("s1", "rg1", "dnszones", "a.com"),
            zone_id("s1", "rg1", "privatednszones", "b.com"),
        ];
        assert!(DnsZoneConfig::from_ids(&mixed_kind).is_err());

        let ok = [
            zone_id("s1", "rg1", "dnszones", "a.com"),
            zone_id("s1", "rg1", "dnszones", "b.com"),
        ];
        let config = DnsZoneConfig::from_ids(&ok).unwrap();
        assert_eq!(config.zone_names, vec!["a.com", "b.com"]);
    }

    #[test]
    fn config_bounds_the_zone_count() {
        assert!(DnsZoneConfig::from_ids(&[]).is_err());
        let eight: Vec<String> = (0..8)
            .map(|i| zone_id("s1", "rg1", "dnszones", &format!("z{i}.com")))
            .collect();
        assert!(DnsZoneConfig::from_ids(&eight).is_err());
    }

    #[test]
    fn partition_splits_by_kind() {
        let ids = [
            zone_id("s1", "rg1", "dnszones", "a.com"),
            zone_id("s1", "rg1", "privatednszones", "b.internal"),
            zone_id("s1", "rg1", "dnszones", "c.com"),
        ];
        let configs = partition_zones(&ids).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].kind, ZoneKind::Public);
        assert_eq!(configs[0].zone_names, vec!["a.com", "c.com"]);
        assert_eq!(configs[1].kind, ZoneKind::Private);
    }
}
