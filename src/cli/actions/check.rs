use crate::config::DaemonConfig;
use anyhow::Result;
use secrecy::ExposeSecret;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Args {
    pub config: PathBuf,
}

/// Load and validate the configuration, then print the resolved values.
/// # Errors
/// Returns an error if the configuration cannot be loaded or is invalid.
pub fn execute(args: &Args) -> Result<()> {
    let mut config = DaemonConfig::load(&args.config)?;
    config.check()?;

    println!("{}", render(&entries(&config)));

    Ok(())
}

fn redacted(secret: &str) -> String {
    if secret.is_empty() {
        "none".to_string()
    } else {
        "REDACTED".to_string()
    }
}

fn pem_summary(pem: &str) -> String {
    if pem.is_empty() {
        "none".to_string()
    } else {
        format!("{} bytes of PEM", pem.len())
    }
}

/// Resolved configuration as `(key, value)` pairs, secrets redacted.
#[must_use]
pub fn entries(config: &DaemonConfig) -> Vec<(&'static str, String)> {
    let radius = &config.radius;

    let mut entries = vec![
        ("radius.binary", radius.binary.display().to_string()),
        ("radius.run_directory", radius.run_directory.display().to_string()),
        (
            "radius.configuration_base",
            radius.configuration_base().display().to_string(),
        ),
        ("radius.interface", radius.interface.clone()),
        ("radius.interface_net", radius.interface_net.clone()),
        ("radius.port", radius.port.to_string()),
        ("radius.debug", radius.debug.to_string()),
        (
            "radius.log_file",
            radius
                .log_file
                .as_ref()
                .map_or_else(|| "stdout".to_string(), |p| p.display().to_string()),
        ),
        ("radius.enable_admin", radius.enable_admin.to_string()),
        (
            "radius.client_net",
            radius
                .client_net
                .clone()
                .unwrap_or_else(|| radius.interface_net.clone()),
        ),
        ("radius.clean_on_stop", radius.clean_on_stop.to_string()),
        ("radius.stay_root", radius.stay_root.to_string()),
        ("radius.secret", redacted(radius.secret.expose_secret())),
        ("radius.ca", pem_summary(&radius.ca)),
        ("radius.certificate", pem_summary(&radius.certificate)),
        ("radius.key", redacted(radius.key.expose_secret())),
        (
            "radius.api",
            format!("http://{}:{}", radius.api_host, radius.api_port),
        ),
        ("radius.api_token", redacted(radius.api_token.expose_secret())),
        ("client.server", config.client.server.clone()),
        ("client.api_version", config.client.api_version.to_string()),
        ("client.token", redacted(config.client.token.expose_secret())),
        (
            "client.source_interface",
            config
                .client
                .source_interface
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        ),
    ];

    match &config.fetcher {
        Some(fetcher) => {
            entries.push((
                "fetcher.interval",
                humantime::format_duration(fetcher.interval).to_string(),
            ));
            entries.push(("fetcher.cache", fetcher.cache.display().to_string()));
            entries.push((
                "fetcher.fetch_timeout",
                fetcher.fetch_timeout.map_or_else(
                    || "none".to_string(),
                    |t| humantime::format_duration(t).to_string(),
                ),
            ));
        }
        None => entries.push(("fetcher", "disabled".to_string())),
    }

    entries
}

/// Aligned `key: value` lines.
#[must_use]
pub fn render(entries: &[(&str, String)]) -> String {
    let width = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);

    entries
        .iter()
        .map(|(key, value)| {
            let padding = " ".repeat(width.saturating_sub(key.len()));
            format!("{key}:{padding} {value}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const CONFIG: &str = r"
client:
  server: https://auth.example.org
  token: client-secret-token
radius:
  binary: /bin/sh
  secret: very-secret
fetcher:
  cache: /var/cache/radrotor
  interval: 12h
";

    #[test]
    fn entries_hide_secrets() -> Result<()> {
        let mut config = DaemonConfig::parse(CONFIG)?;
        config.check()?;

        let out = render(&entries(&config));
        assert!(out.contains("fetcher.interval"));
        assert!(out.contains("12h"));
        assert!(out.contains("https://auth.example.org"));
        assert!(!out.contains("very-secret"));
        assert!(!out.contains("client-secret-token"));
        assert!(!out.contains("PRIVATE KEY"));
        Ok(())
    }

    #[test]
    fn entries_show_run_directory_and_base() -> Result<()> {
        let mut config = DaemonConfig::parse(CONFIG)?;
        config.radius.run_directory = std::path::PathBuf::from("/srv/run");
        config.check()?;

        let entries = entries(&config);
        let value = |key: &str| {
            entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(value("radius.run_directory"), Some("/srv/run".to_string()));
        assert_eq!(
            value("radius.configuration_base"),
            Some("/srv/run/radius".to_string())
        );
        Ok(())
    }

    #[test]
    fn render_aligns_values() {
        let out = render(&[("a", "1".to_string()), ("long.key", "2".to_string())]);
        assert_eq!(out, "a:        1\nlong.key: 2");
    }

    #[test]
    fn execute_checks_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!("radrotor-check-{}.yml", Uuid::new_v4()));
        std::fs::write(&path, CONFIG)?;

        execute(&Args {
            config: path.clone(),
        })?;

        std::fs::write(&path, "radius:\n  binary: /bin/sh\n")?;
        assert!(execute(&Args {
            config: path.clone()
        })
        .is_err());

        std::fs::remove_file(path)?;
        Ok(())
    }
}
