//! Process-wide registry of NIC family capability profiles.
//!
//! Test cases look up the profile of the device under test to decide whether an optional feature
//! is expected to work and whether a check is a known deviation from the verbs specification for
//! that silicon. Each family is registered once; later registrations of the same family are
//! ignored.
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::harness::config::HarnessConfig;
use crate::ibverbs::device::DeviceInfo;
use crate::ibverbs::device_context::{AtomicCapability, DeviceContext};

/// A check whose outcome on a given family departs from what the verbs specification requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Deviation {
    pub test: String,
    /// Empty when the whole test deviates.
    #[serde(default)]
    pub subtest: String,
    pub reason: String,
}

/// What a NIC family supports, keyed by the driver family name that prefixes its device names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityProfile {
    pub family: String,
    #[serde(default = "default_atomic_capability")]
    pub atomic_capability: AtomicCapability,
    #[serde(default = "default_true")]
    pub supports_ipv6: bool,
    #[serde(default = "default_true")]
    pub supports_type2_memory_window: bool,
    #[serde(default)]
    pub supports_rc_remote_mw_atomic: bool,
    #[serde(default = "default_true")]
    pub supports_rc_sq_inline: bool,
    /// Slow NICs need longer completion timeouts.
    #[serde(default)]
    pub is_slow_nic: bool,
    /// Overflowing the CQ moves the QP to ERROR instead of only raising an async event.
    #[serde(default)]
    pub full_cq_idles_qp: bool,
    #[serde(default, rename = "deviation")]
    pub deviations: Vec<Deviation>,
}

fn default_atomic_capability() -> AtomicCapability {
    AtomicCapability::Hca
}

fn default_true() -> bool {
    true
}

impl CapabilityProfile {
    /// A profile that expects full compliance.
    pub fn new(family: impl Into<String>) -> Self {
        CapabilityProfile {
            family: family.into(),
            atomic_capability: default_atomic_capability(),
            supports_ipv6: true,
            supports_type2_memory_window: true,
            supports_rc_remote_mw_atomic: false,
            supports_rc_sq_inline: true,
            is_slow_nic: false,
            full_cq_idles_qp: false,
            deviations: Vec::new(),
        }
    }

    pub fn with_deviation(mut self, test: &str, subtest: &str, reason: &str) -> Self {
        self.deviations.push(Deviation {
            test: test.to_string(),
            subtest: subtest.to_string(),
            reason: reason.to_string(),
        });
        self
    }

    /// The reason `test`/`subtest` is expected to deviate. A deviation registered with an empty
    /// subtest covers every subtest of `test`.
    pub fn deviation(&self, test: &str, subtest: &str) -> Option<&str> {
        self.deviations
            .iter()
            .find(|d| d.test == test && (d.subtest.is_empty() || d.subtest == subtest))
            .map(|d| d.reason.as_str())
    }

    pub fn supports_atomics(&self) -> bool {
        self.atomic_capability != AtomicCapability::None
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<CapabilityProfile>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register `profile` under its family. Returns `false`, leaving the registry untouched, when the
/// family is already registered.
pub fn register(profile: CapabilityProfile) -> bool {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    if registry.contains_key(&profile.family) {
        log::debug!("capability profile for {} already registered", profile.family);
        return false;
    }
    log::debug!("registering capability profile for {}", profile.family);
    registry.insert(profile.family.clone(), Arc::new(profile));
    true
}

pub fn lookup(family: &str) -> Option<Arc<CapabilityProfile>> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(family)
        .cloned()
}

/// Find the profile whose family is the longest prefix of `device_name`, so `mlx5_0` resolves to
/// `mlx5` and `rxe_eth0` to `rxe`.
pub fn lookup_for_device(device_name: &str) -> Option<Arc<CapabilityProfile>> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|(family, _)| device_name.starts_with(family.as_str()))
        .max_by_key(|(family, _)| family.len())
        .map(|(_, profile)| profile.clone())
}

pub fn lookup_for_context(ctx: &DeviceContext) -> Option<Arc<CapabilityProfile>> {
    lookup_for_device(&ctx.name())
}

/// All registered families, sorted.
pub fn registered_families() -> Vec<String> {
    let mut families: Vec<_> = REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    families.sort();
    families
}

/// The profiles shipped with the harness.
pub fn builtin_profiles() -> Vec<CapabilityProfile> {
    let mlx4 = CapabilityProfile {
        supports_ipv6: false,
        full_cq_idles_qp: true,
        ..CapabilityProfile::new("mlx4")
    }
    .with_deviation("MwTest", "BindType1WhileBound", "rebinding a bound type 1 window is accepted")
    .with_deviation("QpStateTest", "ModifyInvalidResetToRts", "returns EINVAL only after a full reset")
    .with_deviation("AsyncEventTest", "", "port events are not generated");

    let mlx5 = CapabilityProfile {
        supports_rc_remote_mw_atomic: true,
        ..CapabilityProfile::new("mlx5")
    }
    .with_deviation("MwType2Test", "InvalidBindLength", "zero length binds complete successfully")
    .with_deviation("CqOverflowTest", "", "overflow is reported as a catastrophic error");

    let rxe = CapabilityProfile {
        is_slow_nic: true,
        supports_rc_remote_mw_atomic: true,
        ..CapabilityProfile::new("rxe")
    }
    .with_deviation("SrqTest", "ArmLimit", "limit events are delivered before the queue drains")
    .with_deviation("QpTest", "MaxInlineData", "inline limit is not enforced")
    .with_deviation("MwType2Test", "BindToUdQp", "binding through a UD QP is not rejected");

    vec![mlx4, mlx5, rxe]
}

/// Register [`builtin_profiles`]. Safe to call any number of times; returns how many profiles
/// were newly registered.
pub fn register_builtin_profiles() -> usize {
    let registered = builtin_profiles().into_iter().map(register).filter(|&new| new).count();
    if registered > 0 {
        log::info!("registered {registered} built-in capability profiles");
    }
    registered
}

/// Register the `[[profile]]` entries of `config`.
pub fn register_config_profiles(config: &HarnessConfig) -> usize {
    config.profiles.iter().cloned().map(register).filter(|&new| new).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_register_is_idempotent() {
        let first = CapabilityProfile::new("test-idempotent");
        let second = CapabilityProfile {
            is_slow_nic: true,
            ..CapabilityProfile::new("test-idempotent")
        };

        assert!(register(first.clone()));
        assert!(!register(second));

        assert_eq!(*lookup("test-idempotent").unwrap(), first);
        let families = registered_families();
        assert_eq!(families.iter().filter(|f| *f == "test-idempotent").count(), 1);
    }

    #[test]
    fn test_builtin_registration_repeats_cleanly() {
        register_builtin_profiles();
        assert_eq!(register_builtin_profiles(), 0);

        for family in ["mlx4", "mlx5", "rxe"] {
            assert_eq!(lookup(family).unwrap().family, family);
        }
        assert!(lookup("rxe").unwrap().is_slow_nic);
        assert!(!lookup("mlx4").unwrap().supports_ipv6);
    }

    #[rstest]
    #[case("mlx5_0", Some("mlx5"))]
    #[case("mlx4_1", Some("mlx4"))]
    #[case("rxe_eth0", Some("rxe"))]
    #[case("test-prefix-long_0", Some("test-prefix-long"))]
    #[case("test-prefix_0", Some("test-prefix"))]
    #[case("bnxt_re0", None)]
    fn test_lookup_for_device(#[case] device_name: &str, #[case] family: Option<&str>) {
        register_builtin_profiles();
        register(CapabilityProfile::new("test-prefix"));
        register(CapabilityProfile::new("test-prefix-long"));

        assert_eq!(
            lookup_for_device(device_name).map(|p| p.family.clone()).as_deref(),
            family
        );
    }

    #[test]
    fn test_deviation_lookup() {
        let profile = CapabilityProfile::new("x")
            .with_deviation("MwTest", "Bind", "bind is accepted")
            .with_deviation("AsyncEventTest", "", "no events");

        assert_eq!(profile.deviation("MwTest", "Bind"), Some("bind is accepted"));
        assert_eq!(profile.deviation("MwTest", "Other"), None);
        assert_eq!(profile.deviation("AsyncEventTest", "PortDown"), Some("no events"));
        assert!(profile.supports_atomics());
    }

    #[test]
    fn test_profiles_from_config() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [[profile]]
            family = "test-config-nic"
            atomic_capability = "global"
            is_slow_nic = true

            [[profile.deviation]]
            test = "QpTest"
            reason = "unsupported"
            "#,
        )
        .unwrap();

        assert_eq!(register_config_profiles(&config), 1);
        assert_eq!(register_config_profiles(&config), 0);

        let profile = lookup("test-config-nic").unwrap();
        assert_eq!(profile.atomic_capability, AtomicCapability::Global);
        assert!(profile.is_slow_nic);
        assert!(profile.supports_type2_memory_window);
        assert_eq!(profile.deviation("QpTest", "Any"), Some("unsupported"));
    }
}
