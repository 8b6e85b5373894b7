//! Drift detection between current and desired child resources.
//!
//! The API server fills in defaults (e.g. `defaultMode` of volumes or
//! `volumeMode` of claims) which the desired objects never carry. Comparing
//! the objects verbatim would therefore report drift on every pass. Instead
//! every field the desired spec sets has to be present with the same value in
//! the current spec, while fields which only exist in the current spec are
//! ignored. Lists have to match element by element, so removing an entry is
//! still detected.
//!
//! The API server also stores resource quantities in canonical form, so
//! `2048Mi` comes back as `2Gi`. Values below `requests`, `limits` and
//! `sizeLimit` are therefore compared by the amount they denote.
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::SvnOperatorError;

/// Whether the spec of the current StatefulSet differs from the desired one.
pub fn stateful_set_drifted(
    current: &StatefulSet,
    desired: &StatefulSet,
) -> Result<bool, SvnOperatorError> {
    Ok(!is_subset(&to_value(&desired.spec)?, &to_value(&current.spec)?))
}

/// Whether the generated files stored in the ConfigMap differ from the desired ones.
pub fn config_map_drifted(current: &ConfigMap, desired: &BTreeMap<String, String>) -> bool {
    match &current.data {
        Some(data) => data != desired,
        None => !desired.is_empty(),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, SvnOperatorError> {
    Ok(serde_json::to_value(value)?)
}

/// Keys whose values (or the values of whose entries) are quantities.
const QUANTITY_KEYS: [&str; 3] = ["requests", "limits", "sizeLimit"];

fn is_subset(desired: &Value, current: &Value) -> bool {
    is_subset_of(desired, current, false)
}

fn is_subset_of(desired: &Value, current: &Value, quantities: bool) -> bool {
    match (desired, current) {
        (Value::Null, _) => true,
        (Value::Object(desired), Value::Object(current)) => {
            desired.iter().all(|(key, desired_value)| match current.get(key) {
                Some(current_value) => is_subset_of(
                    desired_value,
                    current_value,
                    quantities || QUANTITY_KEYS.contains(&key.as_str()),
                ),
                None => desired_value.is_null(),
            })
        }
        (Value::Array(desired), Value::Array(current)) => {
            desired.len() == current.len()
                && desired
                    .iter()
                    .zip(current)
                    .all(|(desired, current)| is_subset_of(desired, current, quantities))
        }
        (Value::String(desired), Value::String(current)) if quantities && desired != current => {
            match (Amount::parse(desired), Amount::parse(current)) {
                (Some(desired), Some(current)) => desired.same_as(&current),
                _ => false,
            }
        }
        (desired, current) => desired == current,
    }
}

/// The exact amount a quantity denotes, `digits / 10^scale`.
#[derive(Debug)]
struct Amount {
    digits: i128,
    scale: u32,
}

impl Amount {
    /// Parses `<sign><number><suffix>` where the suffix is a binary (`Ki`
    /// to `Ei`) or decimal (`n` to `E`) multiplier or an exponent (`e3`).
    /// Returns `None` for malformed quantities and on overflow.
    fn parse(quantity: &str) -> Option<Amount> {
        let quantity = quantity.trim();
        let number_len = quantity
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
            .unwrap_or_else(|| quantity.len());
        let (number, suffix) = quantity.split_at(number_len);

        let (negative, number) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (whole, fraction) = match number.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (number, ""),
        };
        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction)
        {
            return None;
        }

        let mut digits: i128 = format!("{}{}", whole, fraction).parse().ok()?;
        let mut scale = fraction.len() as u32;
        if negative {
            digits = -digits;
        }

        let binary_power = match suffix {
            "Ki" => Some(1),
            "Mi" => Some(2),
            "Gi" => Some(3),
            "Ti" => Some(4),
            "Pi" => Some(5),
            "Ei" => Some(6),
            _ => None,
        };
        if let Some(power) = binary_power {
            digits = digits.checked_mul(1024i128.checked_pow(power)?)?;
            return Some(Amount { digits, scale });
        }

        let exponent: i32 = match suffix {
            "n" => -9,
            "u" => -6,
            "m" => -3,
            "" => 0,
            "k" => 3,
            "M" => 6,
            "G" => 9,
            "T" => 12,
            "P" => 15,
            "E" => 18,
            _ => match suffix.strip_prefix(|c: char| c == 'e' || c == 'E') {
                Some(exponent) => exponent.parse().ok()?,
                None => return None,
            },
        };
        if exponent >= 0 {
            digits = digits.checked_mul(10i128.checked_pow(exponent as u32)?)?;
        } else {
            scale = scale.checked_add(exponent.unsigned_abs())?;
        }
        Some(Amount { digits, scale })
    }

    fn same_as(&self, other: &Amount) -> bool {
        let left = 10i128
            .checked_pow(other.scale)
            .and_then(|factor| self.digits.checked_mul(factor));
        let right = 10i128
            .checked_pow(self.scale)
            .and_then(|factor| other.digits.checked_mul(factor));
        match (left, right) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::PodTemplate;
    use crate::operator::resources::override_with_pod_template;
    use crate::operator::resources::test::{server, DEFAULT_IMAGE};
    use crate::operator::resources::stateful_set_for;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::identical(json!({"a": 1, "b": [1, 2]}), json!({"a": 1, "b": [1, 2]}), true)]
    #[case::defaults_added(json!({"a": {"b": 1}}), json!({"a": {"b": 1, "c": 2}, "d": 3}), true)]
    #[case::value_changed(json!({"a": {"b": 1}}), json!({"a": {"b": 2}}), false)]
    #[case::field_missing(json!({"a": 1}), json!({}), false)]
    #[case::list_entry_removed(json!({"a": [1]}), json!({"a": [1, 2]}), false)]
    #[case::list_entry_added(json!({"a": [1, 2]}), json!({"a": [1]}), false)]
    #[case::null_is_unset(json!({"a": null}), json!({}), true)]
    fn should_compare_as_subset(
        #[case] desired: Value,
        #[case] current: Value,
        #[case] expected: bool,
    ) {
        assert_eq!(expected, is_subset(&desired, &current));
    }

    #[test]
    fn api_server_defaults_should_not_count_as_drift() {
        let server = server("main", PodTemplate::default());
        let mut current = stateful_set_for(&server, DEFAULT_IMAGE).unwrap();
        {
            let spec = current.spec.as_mut().unwrap();
            spec.pod_management_policy = Some(String::from("OrderedReady"));
            spec.revision_history_limit = Some(10);
            let volume = &mut spec.template.spec.as_mut().unwrap().volumes.as_mut().unwrap()[0];
            volume.config_map.as_mut().unwrap().default_mode = Some(420);
        }

        let mut desired = current.clone();
        override_with_pod_template(&server, &mut desired, DEFAULT_IMAGE);

        assert_ne!(current, desired);
        assert!(!stateful_set_drifted(&current, &desired).unwrap());
    }

    #[rstest]
    #[case::binary_to_binary("2048Mi", "2Gi", true)]
    #[case::fraction("0.5Gi", "512Mi", true)]
    #[case::decimal("1.1G", "1100M", true)]
    #[case::exponent("1e3", "1k", true)]
    #[case::milli("1500m", "1.5", true)]
    #[case::binary_is_not_decimal("1Gi", "1G", false)]
    #[case::different_amount("2Gi", "3Gi", false)]
    #[case::malformed("lots", "2Gi", false)]
    fn quantities_should_compare_by_amount(
        #[case] desired: &str,
        #[case] current: &str,
        #[case] expected: bool,
    ) {
        let desired = json!({"resources": {"requests": {"storage": desired}}});
        let current = json!({"resources": {"requests": {"storage": current}}});
        assert_eq!(expected, is_subset(&desired, &current));
    }

    #[test]
    fn quantities_should_only_be_parsed_below_resource_keys() {
        assert!(!is_subset(&json!({"value": "1k"}), &json!({"value": "1000"})));
        assert!(is_subset(
            &json!({"limits": {"memory": "1k"}}),
            &json!({"limits": {"memory": "1000"}})
        ));
    }

    #[test]
    fn canonicalized_storage_request_should_not_count_as_drift() {
        let mut server = server("main", PodTemplate::default());
        let mut requests = BTreeMap::new();
        requests.insert(String::from("storage"), Quantity(String::from("2048Mi")));
        server.spec.volume_claim_template.resources = Some(ResourceRequirements {
            requests: Some(requests),
            ..ResourceRequirements::default()
        });

        // What the API server hands back after storing the StatefulSet
        let mut current = stateful_set_for(&server, DEFAULT_IMAGE).unwrap();
        current.spec.as_mut().unwrap().volume_claim_templates.as_mut().unwrap()[0]
            .spec
            .as_mut()
            .unwrap()
            .resources
            .as_mut()
            .unwrap()
            .requests
            .as_mut()
            .unwrap()
            .insert(String::from("storage"), Quantity(String::from("2Gi")));

        let mut desired = current.clone();
        override_with_pod_template(&server, &mut desired, DEFAULT_IMAGE);

        assert_ne!(current, desired);
        assert!(!stateful_set_drifted(&current, &desired).unwrap());
    }

    #[test]
    fn changed_image_should_count_as_drift() {
        let current = stateful_set_for(&server("main", PodTemplate::default()), DEFAULT_IMAGE).unwrap();
        let mut desired = current.clone();
        let template = PodTemplate {
            image: String::from("svn-server:custom"),
            ..PodTemplate::default()
        };
        override_with_pod_template(&server("main", template), &mut desired, DEFAULT_IMAGE);

        assert!(stateful_set_drifted(&current, &desired).unwrap());
    }

    #[test]
    fn config_map_should_compare_data() {
        let mut data = BTreeMap::new();
        data.insert(String::from("Repos"), String::from("repositories: []\n"));
        let current = ConfigMap {
            data: Some(data.clone()),
            ..ConfigMap::default()
        };

        assert!(!config_map_drifted(&current, &data));
        data.insert(String::from("Repos"), String::from("repositories:\n- name: a\n"));
        assert!(config_map_drifted(&current, &data));
        assert!(config_map_drifted(&ConfigMap::default(), &data));
    }
}
