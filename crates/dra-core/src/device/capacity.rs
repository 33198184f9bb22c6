//! Capacity arithmetic under capacity policies.

use std::collections::BTreeMap;

use crate::device::CapacityValue;
use crate::error::AllocationError;

/// Computes the amounts one allocation consumes from a device, per capacity
/// name.
///
/// Returns `Ok(None)` when the device cannot satisfy the request: the
/// requester named a capacity the device does not declare, or the amount
/// (after policy rounding) exceeds the policy maximum or the device total.
/// Requested amounts that are not positive are a validation error.
///
/// For each capacity the device declares:
/// - a requested amount is validated against the policy: bumped to `min`,
///   rounded up to the next `step` multiple above `min`, rejected above
///   `max`;
/// - an omitted capacity with a policy consumes `policy.default`;
/// - an omitted capacity without a policy consumes the whole amount.
pub fn consumed_capacity(
    requested: &BTreeMap<String, i64>,
    capacity: &BTreeMap<String, CapacityValue>,
) -> Result<Option<BTreeMap<String, i64>>, AllocationError> {
    for name in requested.keys() {
        if !capacity.contains_key(name) {
            return Ok(None);
        }
    }

    let mut consumed = BTreeMap::new();
    for (name, cap) in capacity {
        cap.validate()?;
        let amount = match requested.get(name) {
            Some(&req) => {
                if req <= 0 {
                    return Err(AllocationError::Validation(format!(
                        "requested capacity {} must be positive, got {}",
                        name, req
                    )));
                }
                match &cap.policy {
                    Some(policy) => match apply_policy(policy, req) {
                        Some(rounded) => rounded,
                        None => return Ok(None),
                    },
                    None => req,
                }
            }
            None => match &cap.policy {
                Some(policy) => policy.default,
                None => cap.amount,
            },
        };
        if amount > cap.amount {
            return Ok(None);
        }
        consumed.insert(name.clone(), amount);
    }
    Ok(Some(consumed))
}

/// Rounds a requested amount per the policy; `None` when the rounded amount
/// exceeds the policy maximum.
fn apply_policy(policy: &crate::device::CapacityPolicy, requested: i64) -> Option<i64> {
    let mut amount = requested.max(policy.min);
    if policy.step > 0 {
        let over = amount - policy.min;
        let remainder = over % policy.step;
        if remainder != 0 {
            amount += policy.step - remainder;
        }
    }
    if amount > policy.max {
        None
    } else {
        Some(amount)
    }
}

/// Whether adding `consumed` to what prior allocations already took still
/// fits within the device's declared capacities. Used on the shared path.
pub fn fits_remaining(
    consumed: &BTreeMap<String, i64>,
    existing: &BTreeMap<String, i64>,
    capacity: &BTreeMap<String, CapacityValue>,
) -> bool {
    consumed.iter().all(|(name, amount)| {
        let taken = existing.get(name).copied().unwrap_or(0);
        match capacity.get(name) {
            Some(cap) => taken + amount <= cap.amount,
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CapacityPolicy, CapacityUnit};

    fn percent_capacity(amount: i64, policy: Option<CapacityPolicy>) -> CapacityValue {
        CapacityValue {
            amount,
            unit: CapacityUnit::Percent,
            policy,
        }
    }

    fn share_policy(default: i64, min: i64, max: i64, step: i64) -> CapacityPolicy {
        CapacityPolicy {
            default,
            min,
            max,
            step,
            unit: CapacityUnit::Percent,
        }
    }

    #[test]
    fn requested_amount_is_consumed_as_is() {
        let capacity: BTreeMap<_, _> = [(
            "sharePercent".to_string(),
            percent_capacity(100, Some(share_policy(100, 1, 100, 1))),
        )]
        .into();
        let requested: BTreeMap<_, _> = [("sharePercent".to_string(), 50)].into();
        let consumed = consumed_capacity(&requested, &capacity).unwrap().unwrap();
        assert_eq!(consumed["sharePercent"], 50);
    }

    #[test]
    fn omitted_capacity_with_policy_consumes_the_default() {
        let capacity: BTreeMap<_, _> = [(
            "sharePercent".to_string(),
            percent_capacity(100, Some(share_policy(25, 1, 100, 1))),
        )]
        .into();
        let consumed = consumed_capacity(&BTreeMap::new(), &capacity)
            .unwrap()
            .unwrap();
        assert_eq!(consumed["sharePercent"], 25);
    }

    #[test]
    fn omitted_capacity_without_policy_consumes_everything() {
        let capacity: BTreeMap<_, _> =
            [("memory".to_string(), percent_capacity(40960, None))].into();
        let consumed = consumed_capacity(&BTreeMap::new(), &capacity)
            .unwrap()
            .unwrap();
        assert_eq!(consumed["memory"], 40960);
    }

    #[test]
    fn requested_below_min_is_bumped_to_min() {
        let capacity: BTreeMap<_, _> = [(
            "sharePercent".to_string(),
            percent_capacity(100, Some(share_policy(10, 5, 100, 1))),
        )]
        .into();
        let requested: BTreeMap<_, _> = [("sharePercent".to_string(), 2)].into();
        let consumed = consumed_capacity(&requested, &capacity).unwrap().unwrap();
        assert_eq!(consumed["sharePercent"], 5);
    }

    #[test]
    fn requested_amount_is_rounded_up_to_the_step() {
        // min=10, step=25: requesting 12 rounds to 10 + 25 = 35.
        let capacity: BTreeMap<_, _> = [(
            "sharePercent".to_string(),
            percent_capacity(100, Some(share_policy(10, 10, 100, 25))),
        )]
        .into();
        let requested: BTreeMap<_, _> = [("sharePercent".to_string(), 12)].into();
        let consumed = consumed_capacity(&requested, &capacity).unwrap().unwrap();
        assert_eq!(consumed["sharePercent"], 35);

        // Exact step multiples are untouched.
        let requested: BTreeMap<_, _> = [("sharePercent".to_string(), 60)].into();
        let consumed = consumed_capacity(&requested, &capacity).unwrap().unwrap();
        assert_eq!(consumed["sharePercent"], 60);
    }

    #[test]
    fn rounding_past_max_rejects_the_device() {
        let capacity: BTreeMap<_, _> = [(
            "sharePercent".to_string(),
            percent_capacity(100, Some(share_policy(10, 10, 40, 25))),
        )]
        .into();
        let requested: BTreeMap<_, _> = [("sharePercent".to_string(), 39)].into();
        assert!(consumed_capacity(&requested, &capacity).unwrap().is_none());
    }

    #[test]
    fn unknown_requested_capacity_rejects_the_device() {
        let capacity: BTreeMap<_, _> =
            [("memory".to_string(), percent_capacity(100, None))].into();
        let requested: BTreeMap<_, _> = [("sharePercent".to_string(), 50)].into();
        assert!(consumed_capacity(&requested, &capacity).unwrap().is_none());
    }

    #[test]
    fn non_positive_request_is_a_validation_error() {
        let capacity: BTreeMap<_, _> =
            [("memory".to_string(), percent_capacity(100, None))].into();
        let requested: BTreeMap<_, _> = [("memory".to_string(), 0)].into();
        assert!(consumed_capacity(&requested, &capacity).is_err());
    }

    #[test]
    fn fits_remaining_tracks_prior_consumption() {
        let capacity: BTreeMap<_, _> = [(
            "sharePercent".to_string(),
            percent_capacity(100, Some(share_policy(100, 1, 100, 1))),
        )]
        .into();
        let consumed: BTreeMap<_, _> = [("sharePercent".to_string(), 50)].into();
        let mut existing = BTreeMap::new();
        assert!(fits_remaining(&consumed, &existing, &capacity));
        existing.insert("sharePercent".to_string(), 50);
        assert!(fits_remaining(&consumed, &existing, &capacity));
        existing.insert("sharePercent".to_string(), 51);
        assert!(!fits_remaining(&consumed, &existing, &capacity));
    }
}
