//! Platform-specific audio subsystem bindings.

#[cfg(windows)]
mod wasapi;

#[cfg(windows)]
pub use wasapi::WasapiSubsystem;

// Re-export the appropriate subsystem for the current platform
#[cfg(windows)]
pub type PlatformSubsystem = WasapiSubsystem;

#[cfg(not(windows))]
pub type PlatformSubsystem = crate::provider::NullSubsystem;

/// The audio subsystem of the running platform.
pub fn default_subsystem() -> PlatformSubsystem {
    PlatformSubsystem::default()
}
