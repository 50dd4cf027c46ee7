//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// One orchestrated run, from environment acquisition to terminal outcome.
    SessionId,
    "ses"
);

define_id!(
    /// One acquired ephemeral environment (a provisioned VM).
    EnvironmentId,
    "env"
);
