// SPDX-License-Identifier: GPL-3.0-only

use tracing_subscriber::{EnvFilter, fmt};

fn default_directives(level: &str) -> String {
    format!("storage_udevwatch={level},cosmic_ext_storage_udevwatch={level},warn")
}

/// Log to stderr, honouring `RUST_LOG` unless `force_level` is set.
pub fn init(level: &str, force_level: bool) {
    let filter = if force_level {
        EnvFilter::new(default_directives(level))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_cover_both_crates() {
        assert_eq!(
            default_directives("debug"),
            "storage_udevwatch=debug,cosmic_ext_storage_udevwatch=debug,warn"
        );
        assert!(EnvFilter::try_new(default_directives("info")).is_ok());
    }
}
