use supports_color::Stream;
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber used by the runner. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(detect_ansi())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

/// Log lines go to stderr, so colour support is probed there.
fn detect_ansi() -> bool {
    supports_color::on_cached(Stream::Stderr).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ansi_follows_stderr_color_support() {
        assert_eq!(
            detect_ansi(),
            supports_color::on_cached(Stream::Stderr).is_some()
        );
    }

    #[test]
    fn second_init_reports_an_error() {
        let _ = init();
        assert!(init().is_err());
    }
}
