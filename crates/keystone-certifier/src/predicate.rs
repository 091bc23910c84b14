//! Invariant evaluation over a node's JSON state.

use keystone_core::{Invariant, Predicate, PredicateResult};
use serde_json::Value;

fn lookup<'a>(state: &'a Value, path: &str) -> Option<&'a Value> {
    let found = if path.is_empty() || path.starts_with('/') {
        state.pointer(path)
    } else {
        state.pointer(&format!("/{}", path))
    };
    found.filter(|v| !v.is_null())
}

fn number(state: &Value, path: &str) -> std::result::Result<f64, String> {
    match lookup(state, path) {
        Some(v) => v
            .as_f64()
            .ok_or_else(|| format!("{} is not a number: {}", path, v)),
        None => Err(format!("{} is missing", path)),
    }
}

/// Evaluate one predicate. `Err` carries a human-readable reason for the failure.
pub fn evaluate(predicate: &Predicate, state: &Value) -> std::result::Result<(), String> {
    match predicate {
        Predicate::Exists { path } => lookup(state, path)
            .map(|_| ())
            .ok_or_else(|| format!("{} is missing", path)),
        Predicate::Equals { path, value } => match lookup(state, path) {
            Some(v) if v == value => Ok(()),
            Some(v) => Err(format!("{} is {}, expected {}", path, v, value)),
            None => Err(format!("{} is missing, expected {}", path, value)),
        },
        Predicate::NotEquals { path, value } => match lookup(state, path) {
            Some(v) if v == value => Err(format!("{} must not be {}", path, value)),
            _ => Ok(()),
        },
        Predicate::AtLeast { path, min } => {
            let n = number(state, path)?;
            if n >= *min {
                Ok(())
            } else {
                Err(format!("{} is {}, below {}", path, n, min))
            }
        }
        Predicate::AtMost { path, max } => {
            let n = number(state, path)?;
            if n <= *max {
                Ok(())
            } else {
                Err(format!("{} is {}, above {}", path, n, max))
            }
        }
        Predicate::OneOf { path, values } => match lookup(state, path) {
            Some(v) if values.contains(v) => Ok(()),
            Some(v) => Err(format!("{} is {}, not one of {:?}", path, v, values)),
            None => Err(format!("{} is missing", path)),
        },
        Predicate::NonEmpty { path } => match lookup(state, path) {
            Some(Value::String(s)) if !s.is_empty() => Ok(()),
            Some(Value::Array(a)) if !a.is_empty() => Ok(()),
            Some(Value::Object(o)) if !o.is_empty() => Ok(()),
            Some(_) => Err(format!("{} is empty", path)),
            None => Err(format!("{} is missing", path)),
        },
        Predicate::All { predicates } => predicates.iter().try_for_each(|p| evaluate(p, state)),
        Predicate::Any { predicates } => {
            let mut reasons = Vec::new();
            for p in predicates {
                match evaluate(p, state) {
                    Ok(()) => return Ok(()),
                    Err(r) => reasons.push(r),
                }
            }
            Err(format!("none matched: {}", reasons.join("; ")))
        }
        Predicate::Not { predicate } => match evaluate(predicate, state) {
            Ok(()) => Err("negated predicate held".to_string()),
            Err(_) => Ok(()),
        },
    }
}

/// Evaluate every invariant, in declaration order.
pub fn evaluate_invariants(invariants: &[Invariant], state: &Value) -> Vec<PredicateResult> {
    invariants
        .iter()
        .map(|inv| match evaluate(&inv.predicate, state) {
            Ok(()) => PredicateResult {
                invariant: inv.id.clone(),
                passed: true,
                detail: None,
            },
            Err(reason) => PredicateResult {
                invariant: inv.id.clone(),
                passed: false,
                detail: Some(reason),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> Value {
        json!({
            "healthy": true,
            "replicas": 3,
            "region": "eu-west",
            "endpoints": ["a"],
            "tags": {},
            "gone": null
        })
    }

    #[test]
    fn leaf_predicates() {
        let s = state();
        assert!(evaluate(&Predicate::exists("/healthy"), &s).is_ok());
        assert!(evaluate(&Predicate::exists("/gone"), &s).is_err());
        assert!(evaluate(&Predicate::equals("healthy", json!(true)), &s).is_ok());
        assert!(evaluate(&Predicate::at_least("/replicas", 3.0), &s).is_ok());
        assert!(evaluate(&Predicate::at_least("/replicas", 4.0), &s).is_err());
        assert!(evaluate(&Predicate::AtMost { path: "/region".into(), max: 1.0 }, &s)
            .unwrap_err()
            .contains("not a number"));
        assert!(evaluate(
            &Predicate::OneOf {
                path: "/region".into(),
                values: vec![json!("us-east"), json!("eu-west")]
            },
            &s
        )
        .is_ok());
        assert!(evaluate(&Predicate::NonEmpty { path: "/endpoints".into() }, &s).is_ok());
        assert!(evaluate(&Predicate::NonEmpty { path: "/tags".into() }, &s).is_err());
        assert!(evaluate(
            &Predicate::NotEquals {
                path: "/missing".into(),
                value: json!(1)
            },
            &s
        )
        .is_ok());
    }

    #[test]
    fn combinators() {
        let s = state();
        let all = Predicate::All {
            predicates: vec![Predicate::exists("/healthy"), Predicate::at_least("/replicas", 5.0)],
        };
        assert!(evaluate(&all, &s).unwrap_err().contains("below 5"));

        let any = Predicate::Any {
            predicates: vec![Predicate::exists("/nope"), Predicate::exists("/region")],
        };
        assert!(evaluate(&any, &s).is_ok());

        let not = Predicate::Not {
            predicate: Box::new(Predicate::exists("/nope")),
        };
        assert!(evaluate(&not, &s).is_ok());
    }

    #[test]
    fn results_keep_declaration_order() {
        let invariants = vec![
            Invariant {
                id: "up".into(),
                predicate: Predicate::equals("/healthy", json!(true)),
            },
            Invariant {
                id: "scaled".into(),
                predicate: Predicate::at_least("/replicas", 10.0),
            },
        ];
        let results = evaluate_invariants(&invariants, &state());
        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[1].invariant, "scaled");
        assert!(results[1].detail.is_some());
    }
}
