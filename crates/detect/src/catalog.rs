//! Endpoint catalog: the active devices of one direction.

use crate::error::Result;
use crate::provider::AudioSubsystem;
use crate::types::{Direction, Endpoint, UNKNOWN_DEVICE};

/// Enumerate the endpoints the OS currently reports as active.
///
/// Nothing is cached; every call is a fresh enumeration pass.
pub fn list_active_endpoints<S>(subsystem: &S, direction: Direction) -> Result<Vec<Endpoint>>
where
    S: AudioSubsystem + ?Sized,
{
    let endpoints = subsystem.active_endpoints(direction).map_err(|e| {
        tracing::warn!(?direction, error = %e, "endpoint_enumeration_failed");
        e
    })?;

    let endpoints: Vec<Endpoint> = endpoints
        .into_iter()
        .filter_map(|mut endpoint| {
            if endpoint.id.is_empty() {
                tracing::debug!(name = %endpoint.name, "skipping_endpoint_without_id");
                return None;
            }
            if endpoint.name.trim().is_empty() {
                endpoint.name = UNKNOWN_DEVICE.to_string();
            }
            Some(endpoint)
        })
        .collect();

    tracing::debug!(?direction, count = endpoints.len(), "endpoints_enumerated");
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectError;
    use crate::fake::FakeSubsystem;

    #[test]
    fn test_filters_by_direction() {
        let fake = FakeSubsystem::new();
        fake.add_endpoint(Endpoint::new("mic", "Mic", Direction::Capture));
        fake.add_endpoint(Endpoint::new("spk", "Speakers", Direction::Render));

        let capture = list_active_endpoints(&fake, Direction::Capture).unwrap();
        assert_eq!(capture.len(), 1);
        assert_eq!(capture[0].id, "mic");
    }

    #[test]
    fn test_skips_unnamed_and_unidentified() {
        let fake = FakeSubsystem::new();
        fake.add_endpoint(Endpoint::new("", "Ghost", Direction::Capture));
        fake.add_endpoint(Endpoint::new("mic", "  ", Direction::Capture));

        let capture = list_active_endpoints(&fake, Direction::Capture).unwrap();
        assert_eq!(capture.len(), 1);
        assert_eq!(capture[0].name, UNKNOWN_DEVICE);
    }

    #[test]
    fn test_propagates_subsystem_failure() {
        let fake = FakeSubsystem::new();
        fake.fail_enumeration(DetectError::subsystem("CoInitializeEx failed"));

        let err = list_active_endpoints(&fake, Direction::Capture).unwrap_err();
        assert!(matches!(err, DetectError::SubsystemUnavailable { .. }));
    }
}
