use rocket::figment::providers::Env;
use rocket::figment::Figment;
use serde::Deserialize;
use std::path::PathBuf;

use crate::sd::WriteError;

#[derive(Debug, Clone, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct Config {
    pub file_sd_directory: PathBuf,
}

impl Config {
    /// Reads `file_sd_directory` from Rocket's figment (`Rocket.toml`,
    /// `ROCKET_FILE_SD_DIRECTORY`), letting a plain `FILE_SD_DIRECTORY`
    /// environment variable take precedence.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        figment
            .clone()
            .merge(Env::raw().only(&["file_sd_directory"]))
            .extract()
            .map_err(|err| ConfigError::Invalid(Box::new(err)))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config: {0}")]
    Invalid(Box<rocket::figment::Error>),

    #[error("could not use discovery directory {}: {source}", path.display())]
    Directory { path: PathBuf, source: WriteError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_from_figment() {
        if std::env::var_os("FILE_SD_DIRECTORY").is_some() {
            return;
        }

        let figment = Figment::new().merge(("file_sd_directory", "/var/lib/prometheus/sd"));
        let config = Config::from_figment(&figment).expect("load config");
        assert_eq!(config.file_sd_directory, PathBuf::from("/var/lib/prometheus/sd"));
    }

    #[test]
    fn missing_directory() {
        if std::env::var_os("FILE_SD_DIRECTORY").is_some() {
            return;
        }

        let err = Config::from_figment(&Figment::new()).unwrap_err();
        assert!(err.to_string().contains("file_sd_directory"));
    }
}
