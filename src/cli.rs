use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::models::{ContentLength, ContentType, StyleFlag};

#[derive(Parser)]
#[command(name = "pamphlet", about = "AI content generation bot with PDF delivery")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Generate a single document and write it to disk
    Generate {
        /// Main topic of the content
        topic: String,

        #[arg(long = "type", value_enum, default_value = "leaflet")]
        content_type: ContentType,

        #[arg(long, value_enum, default_value = "medium")]
        length: ContentLength,

        /// Style switch, repeatable
        #[arg(long = "style", value_enum)]
        styles: Vec<StyleFlag>,

        /// Extra prompt field as key=value, repeatable
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        /// Where to write the PDF
        #[arg(long, short, default_value = "content.pdf")]
        output: PathBuf,
    },

    /// Show a user's daily request counter
    Usage {
        user_id: i64,
    },
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_command() {
        let cli = Cli::try_parse_from([
            "pamphlet",
            "generate",
            "Solar energy",
            "--type",
            "research",
            "--length",
            "very-brief",
            "--style",
            "bullet-points",
            "--style",
            "use-emoji",
            "--field",
            "audience=students",
            "-o",
            "out.pdf",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Generate {
                topic,
                content_type,
                length,
                styles,
                fields,
                output,
            }) => {
                assert_eq!(topic, "Solar energy");
                assert_eq!(content_type, ContentType::Research);
                assert_eq!(length, ContentLength::VeryBrief);
                assert_eq!(styles, vec![StyleFlag::BulletPoints, StyleFlag::UseEmoji]);
                assert_eq!(fields, vec![("audience".to_string(), "students".to_string())]);
                assert_eq!(output, PathBuf::from("out.pdf"));
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn rejects_malformed_field() {
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=value").is_err());
        assert_eq!(parse_field("a=b=c").unwrap(), ("a".to_string(), "b=c".to_string()));
    }

    #[test]
    fn defaults_to_daemon() {
        let cli = Cli::try_parse_from(["pamphlet", "-c", "/etc/pamphlet.toml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("/etc/pamphlet.toml"));
    }
}
