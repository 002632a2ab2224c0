//! Platform host backends.
//!
//! `cpal_host` provides a real [`MediaHost`](crate::media::MediaHost) for
//! audio endpoints; on Windows, endpoint hot-plug is reported through
//! IMMNotificationClient.

#[cfg(feature = "cpal-host")]
pub mod cpal_host;
#[cfg(windows)]
pub mod notifier;

#[cfg(feature = "cpal-host")]
pub use cpal_host::CpalHost;
#[cfg(windows)]
pub use notifier::EndpointNotifier;
