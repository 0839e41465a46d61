use chrono::{DateTime, Utc};

use crate::state_machine::Operation;

/// Store-assigned numeric identity
pub type EntityId = i64;

/// Identity of a record that has not been persisted yet
pub const TRANSIENT_ID: EntityId = 0;

/// Common surface of every persisted record
pub trait Entity {
    fn id(&self) -> EntityId;

    fn insertion_time(&self) -> DateTime<Utc>;

    fn modification_time(&self) -> DateTime<Utc>;

    /// True until the store has assigned an identity
    fn is_transient(&self) -> bool {
        self.id() == TRANSIENT_ID
    }
}

/// Identity equality: persisted records with the same id are the same record,
/// transient records are never equal to anything.
pub fn same_entity<E: Entity + ?Sized>(a: &E, b: &E) -> bool {
    !a.is_transient() && !b.is_transient() && a.id() == b.id()
}

/// Records whose Operation drives pipeline work
pub trait HasOperation {
    fn operation(&self) -> Operation;

    /// Short name used in logs and errors (`in_message`, `out_exception`, ...)
    fn entity_kind(&self) -> &'static str;

    fn entity_id(&self) -> EntityId;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutMessage;

    #[test]
    fn test_transient_entities_are_never_equal() {
        let a = OutMessage::new("same@test");
        let b = OutMessage::new("same@test");
        assert!(a.is_transient());
        assert!(!same_entity(&a, &b));
        assert_ne!(a, a.clone());
    }

    #[test]
    fn test_persisted_entities_compare_by_id() {
        let mut a = OutMessage::new("one@test");
        let mut b = OutMessage::new("two@test");
        a.id = 9;
        b.id = 9;
        assert!(same_entity(&a, &b));
        assert_eq!(a, b);
    }
}
