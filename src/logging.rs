use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr subscriber. `CONSULTA_LOG` wins over the `-v` count.
pub fn init(verbosity: u8) {
    let filter = match std::env::var("CONSULTA_LOG") {
        Ok(spec) if !spec.trim().is_empty() => EnvFilter::new(spec),
        _ => EnvFilter::new(default_directive(verbosity)),
    };

    // A second init (tests, embedded use) is not an error worth surfacing.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "consulta=warn",
        1 => "consulta=info",
        _ => "consulta=debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(default_directive(0), "consulta=warn");
        assert_eq!(default_directive(1), "consulta=info");
        assert_eq!(default_directive(5), "consulta=debug");
    }
}
