//! Unique identifier generation for device ids, request ids and idempotency keys.

use uuid::Uuid;

/// Produces random unique identifiers.
pub trait IdGenerator: Send + Sync {
  fn generate(&self) -> String;
}

/// Random (v4) UUID generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
  fn generate(&self) -> String {
    Uuid::new_v4().to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_generates_distinct_ids() {
    let ids = UuidGenerator;
    assert_ne!(ids.generate(), ids.generate());
  }
}
