//! Core aggregate and domain event traits.

use common::AggregateId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// A fact recorded on an aggregate's stream, named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Name stored in the envelope's `event_type` column.
    fn event_type(&self) -> &'static str;
}

/// An event-sourced entity (orders, workflow instances).
///
/// State is never written in place: command methods decide which events to
/// emit and `apply` folds them. Replaying a stream from version 1 therefore
/// reproduces the exact state that was persisted, which is what crash
/// recovery relies on.
pub trait Aggregate: Default + Send + Sync + Sized {
    type Event: DomainEvent;

    type Error: std::error::Error + Send + Sync;

    /// Stream kind, e.g. `"Order"`.
    fn aggregate_type() -> &'static str;

    /// None until the creating event has been applied.
    fn id(&self) -> Option<AggregateId>;

    /// Version of the last applied event; 0 for a fresh aggregate.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    /// Folds one event into the state. Must be deterministic and infallible.
    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }

    /// True once the creating event has been applied.
    fn exists(&self) -> bool {
        self.id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum DriverEvent {
        Registered { id: AggregateId },
        TripLogged,
    }

    impl DomainEvent for DriverEvent {
        fn event_type(&self) -> &'static str {
            match self {
                DriverEvent::Registered { .. } => "DriverRegistered",
                DriverEvent::TripLogged => "TripLogged",
            }
        }
    }

    #[derive(Debug, Default)]
    struct Driver {
        id: Option<AggregateId>,
        trips: u32,
        version: Version,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("driver error")]
    struct DriverError;

    impl Aggregate for Driver {
        type Event = DriverEvent;
        type Error = DriverError;

        fn aggregate_type() -> &'static str {
            "Driver"
        }

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                DriverEvent::Registered { id } => self.id = Some(id),
                DriverEvent::TripLogged => self.trips += 1,
            }
        }
    }

    #[test]
    fn test_apply_events_folds_in_order() {
        let mut driver = Driver::default();
        assert!(!driver.exists());

        let id = AggregateId::new();
        driver.apply_events(vec![
            DriverEvent::Registered { id },
            DriverEvent::TripLogged,
            DriverEvent::TripLogged,
        ]);

        assert!(driver.exists());
        assert_eq!(driver.id(), Some(id));
        assert_eq!(driver.trips, 2);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(DriverEvent::TripLogged.event_type(), "TripLogged");
        assert_eq!(
            DriverEvent::Registered { id: AggregateId::new() }.event_type(),
            "DriverRegistered"
        );
    }
}
