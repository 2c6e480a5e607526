use clap::{builder::ValueParser, Arg, ArgAction, Command};

/// Accepts `0`-`5` or a level name.
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new("verbosity")
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("RADROTOR_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_names_and_numbers() {
        let parser = validator_log_level();
        let command = Command::new("t").arg(Arg::new("level").value_parser(parser));

        for (value, expected) in [("warn", 1u8), ("TRACE", 4), ("5", 5), ("0", 0)] {
            let matches = command
                .clone()
                .try_get_matches_from(["t", value])
                .map_err(|e| e.to_string());
            assert_eq!(
                matches.map(|m| m.get_one::<u8>("level").copied()),
                Ok(Some(expected)),
                "{value}"
            );
        }

        assert!(command.clone().try_get_matches_from(["t", "6"]).is_err());
        assert!(command.try_get_matches_from(["t", "loud"]).is_err());
    }
}
