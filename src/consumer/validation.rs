//! The pluggable `validate(message) -> errors` port (spec §1 "out of scope":
//! the concrete schema-validation library is external; the core only needs
//! this trait).

/// Validates a decoded payload against the schema registered for its
/// logical type name. Implementations wrap whatever validation library the
/// host application chooses (not part of this crate's scope).
pub trait Validator: Send + Sync {
    /// Returns a list of human-readable validation errors; empty means valid.
    fn validate(&self, message_type: &str, payload: &serde_json::Value) -> Vec<String>;
}

/// A validator that accepts everything — the default when no schema
/// validation library is registered.
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate(&self, _message_type: &str, _payload: &serde_json::Value) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_validator_always_passes() {
        let v = NoopValidator;
        assert!(v.validate("Anything", &serde_json::json!({})).is_empty());
    }
}
