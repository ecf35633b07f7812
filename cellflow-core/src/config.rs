//! Diagnostics Configuration
//!
//! Leak heuristics are configured per cell graph rather than through
//! process statics. A [`Diagnostics`] value is shared behind an `Rc` and
//! handed to cells, channels and tokens when they are constructed; derived
//! cells inherit the configuration of the cell they were derived from.
//!
//! ```rust,ignore
//! let diagnostics = Diagnostics::from_json(r#"{ "subscriber_leak_threshold": 50 }"#)?;
//! let cell = ValueCell::with_diagnostics(Some(0), diagnostics.shared());
//! ```

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{CellError, CellResult};

/// Default number of subscribers on one channel before a leak warning.
pub const DEFAULT_SUBSCRIBER_LEAK_THRESHOLD: usize = 1000;

/// Default number of callbacks on one token before a leak warning.
pub const DEFAULT_CANCELLABLE_LEAK_THRESHOLD: usize = 10_000;

/// Thresholds for the non-fatal subscription leak heuristics.
///
/// `None` disables the corresponding warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnostics {
    /// Subscribers on a single event channel before a warning is logged.
    pub subscriber_leak_threshold: Option<usize>,

    /// Callbacks on a single cancellation token before a warning is logged.
    pub cancellable_leak_threshold: Option<usize>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            subscriber_leak_threshold: Some(DEFAULT_SUBSCRIBER_LEAK_THRESHOLD),
            cancellable_leak_threshold: Some(DEFAULT_CANCELLABLE_LEAK_THRESHOLD),
        }
    }
}

impl Diagnostics {
    /// Configuration with every warning turned off.
    pub fn silent() -> Self {
        Self {
            subscriber_leak_threshold: None,
            cancellable_leak_threshold: None,
        }
    }

    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> CellResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CellError::failed(format!("invalid diagnostics config: {e}")))
    }

    /// Wrap into the shared form cells expect.
    pub fn shared(self) -> Rc<Self> {
        Rc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_both_warnings() {
        let diagnostics = Diagnostics::default();
        assert_eq!(
            diagnostics.subscriber_leak_threshold,
            Some(DEFAULT_SUBSCRIBER_LEAK_THRESHOLD)
        );
        assert_eq!(
            diagnostics.cancellable_leak_threshold,
            Some(DEFAULT_CANCELLABLE_LEAK_THRESHOLD)
        );
    }

    #[test]
    fn json_overrides_only_given_fields() {
        let diagnostics = Diagnostics::from_json(r#"{ "subscriber_leak_threshold": 3 }"#).unwrap();
        assert_eq!(diagnostics.subscriber_leak_threshold, Some(3));
        assert_eq!(
            diagnostics.cancellable_leak_threshold,
            Some(DEFAULT_CANCELLABLE_LEAK_THRESHOLD)
        );

        let diagnostics = Diagnostics::from_json(r#"{ "cancellable_leak_threshold": null }"#).unwrap();
        assert_eq!(diagnostics.cancellable_leak_threshold, None);
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(Diagnostics::from_json("{ nope").is_err());
    }
}
