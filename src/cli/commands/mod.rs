use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

use crate::config::DEFAULT_CONFIG_PATH;

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("logtail_exporter")
        .about("Prometheus exporter that tails CSV-style logs on remote hosts over SSH")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("5000")
                .env("LOGTAIL_EXPORTER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the scrape configuration")
                .default_value(DEFAULT_CONFIG_PATH)
                .env("SCRAPECONFIG")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let matches = new().try_get_matches_from(["logtail_exporter"]);

        assert!(matches.is_ok());
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "logtail_exporter");
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_check_port_and_config() {
        let command = new();
        let matches = command.get_matches_from(vec![
            "logtail_exporter",
            "--port",
            "8080",
            "--config",
            "/tmp/scrapeconfig.yml",
        ]);

        assert_eq!(matches.get_one::<u16>("port").copied(), Some(8080));
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("/tmp/scrapeconfig.yml")
        );
    }

    #[test]
    fn test_default_config_path() {
        let matches = new().get_matches_from(vec!["logtail_exporter"]);

        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("/etc/scrapeconfig.yml")
        );
    }
}
