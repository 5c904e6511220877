use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::{launch, Build, Rocket};
use rocket_dyn_templates::Template;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, ConfigError};
use crate::registry::Registry;
use crate::sd::DiscoveryDir;

mod api;
mod config;
mod error;
mod payload;
mod registry;
mod sd;

#[launch]
fn launch() -> Rocket<Build> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    build(rocket::Config::figment())
}

pub fn build(figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .mount("/", api::routes())
        .register("/", api::catchers())
        .attach(Template::fairing())
        .attach(AdHoc::try_on_ignite("Target registry", |rocket| async move {
            match open_registry(rocket.figment()) {
                Ok(registry) => {
                    info!(
                        "Serving target groups from {}",
                        registry.dir().path().display()
                    );
                    Ok(rocket.manage(registry))
                }
                Err(err) => {
                    error!("{}", err);
                    Err(rocket)
                }
            }
        }))
}

fn open_registry(figment: &Figment) -> Result<Registry, ConfigError> {
    let config = Config::from_figment(figment)?;
    let dir = DiscoveryDir::new(&config.file_sd_directory);

    dir.prepare()
        .and_then(|()| Registry::load(dir))
        .map_err(|source| ConfigError::Directory {
            path: config.file_sd_directory,
            source,
        })
}
