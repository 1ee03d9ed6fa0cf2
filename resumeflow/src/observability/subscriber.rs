//! Global subscriber setup.

use crate::errors::FlowError;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber.
///
/// `filter` uses `RUST_LOG` syntax and is overridden by `RUST_LOG` when set.
/// `json` switches to one JSON object per line. If a subscriber is already
/// installed this leaves it in place.
pub fn init_tracing(filter: &str, json: bool) -> Result<(), FlowError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter).map_err(|e| FlowError::Config(format!("invalid log filter: {e}")))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_a_no_op() {
        init_tracing("resumeflow=debug", false).unwrap();
        init_tracing("resumeflow=info", true).unwrap();
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(matches!(init_tracing("resumeflow=loudest", false), Err(FlowError::Config(_))));
    }
}
