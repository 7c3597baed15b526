//! Canonical content hashing for query constraints.
//!
//! The hash is meant to be used as a cache-key component: two constraints
//! that differ only in the order of their predicate or order-by lists hash
//! identically, while any difference in column id, operator, value, limit,
//! offset, or sort direction produces a different hash.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::types::QueryConstraint;

/// Compute the SHA-256 hash of a serializable value.
///
/// The value is serialized to JSON before hashing, ensuring deterministic
/// output. Returns a 64-character lowercase hexadecimal string.
pub(crate) fn compute_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

impl QueryConstraint {
    /// Canonical content hash of this constraint.
    ///
    /// Predicates are sorted by `(column_id, operator)` and order-by
    /// fragments by `(column_id, descending)` before serialization, so
    /// semantically identical constraints supplied in a different list
    /// order share a hash. Duplicate `(column_id, operator)` pairs are
    /// tie-broken on the serialized value to keep the ordering total.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        let mut canonical = self.clone();
        canonical.columns.sort_by(|a, b| {
            (a.column_id, a.operator)
                .cmp(&(b.column_id, b.operator))
                .then_with(|| a.value.to_string().cmp(&b.value.to_string()))
        });
        canonical
            .order_by
            .sort_by_key(|o| (o.column_id, o.descending));
        compute_hash(&canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{ColumnConstraint, ConstraintOperator, OrderConstraint};
    use super::*;
    use serde_json::json;

    fn predicate(column_id: i64, operator: ConstraintOperator, value: serde_json::Value) -> ColumnConstraint {
        ColumnConstraint {
            column_id,
            operator,
            value,
        }
    }

    fn sample() -> QueryConstraint {
        QueryConstraint {
            columns: vec![
                predicate(0, ConstraintOperator::Equal, json!("alpha")),
                predicate(2, ConstraintOperator::Greater, json!(10)),
                predicate(2, ConstraintOperator::Less, json!(99)),
            ],
            order_by: vec![
                OrderConstraint {
                    column_id: 1,
                    descending: true,
                },
                OrderConstraint {
                    column_id: 0,
                    descending: false,
                },
            ],
            limit: Some(50),
            offset: Some(10),
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let constraint = sample();
        assert_eq!(constraint.hash().unwrap(), constraint.hash().unwrap());
        assert_eq!(constraint.hash().unwrap().len(), 64);
    }

    #[test]
    fn test_permutations_hash_identically() {
        let constraint = sample();

        let mut shuffled = constraint.clone();
        shuffled.columns.reverse();
        shuffled.order_by.reverse();

        assert_eq!(constraint.hash().unwrap(), shuffled.hash().unwrap());
    }

    #[test]
    fn test_duplicate_column_operator_pairs_are_order_independent() {
        let a = QueryConstraint {
            columns: vec![
                predicate(1, ConstraintOperator::Equal, json!("x")),
                predicate(1, ConstraintOperator::Equal, json!("y")),
            ],
            ..Default::default()
        };
        let mut b = a.clone();
        b.columns.reverse();

        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_any_field_difference_changes_the_hash() {
        let base = sample();
        let base_hash = base.hash().unwrap();

        let variants: Vec<QueryConstraint> = vec![
            // Different column id.
            {
                let mut c = base.clone();
                c.columns[0].column_id = 7;
                c
            },
            // Different operator.
            {
                let mut c = base.clone();
                c.columns[1].operator = ConstraintOperator::GreaterOrEqual;
                c
            },
            // Different value.
            {
                let mut c = base.clone();
                c.columns[0].value = json!("beta");
                c
            },
            // Different sort direction.
            {
                let mut c = base.clone();
                c.order_by[0].descending = false;
                c
            },
            // Different limit / offset / absent limit.
            {
                let mut c = base.clone();
                c.limit = Some(51);
                c
            },
            {
                let mut c = base.clone();
                c.offset = None;
                c
            },
            // Dropped predicate.
            {
                let mut c = base.clone();
                c.columns.pop();
                c
            },
        ];

        let mut seen = std::collections::HashSet::new();
        seen.insert(base_hash);
        for variant in &variants {
            assert!(
                seen.insert(variant.hash().unwrap()),
                "collision for {variant:?}"
            );
        }
    }

    #[test]
    fn test_generated_corpus_has_no_collisions() {
        let mut seen = std::collections::HashSet::new();
        let operators = [
            ConstraintOperator::Equal,
            ConstraintOperator::NotEqual,
            ConstraintOperator::Greater,
            ConstraintOperator::Less,
        ];

        for column_id in 0..4_i64 {
            for operator in operators {
                for value in [json!(1), json!("1"), json!(true), json!(null)] {
                    for limit in [None, Some(10)] {
                        let constraint = QueryConstraint {
                            columns: vec![predicate(column_id, operator, value.clone())],
                            limit,
                            ..Default::default()
                        };
                        assert!(
                            seen.insert(constraint.hash().unwrap()),
                            "collision for {constraint:?}"
                        );
                    }
                }
            }
        }
    }
}
