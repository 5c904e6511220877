use rocket::http::Status;
use rocket::response::content;
use rocket::serde::json::Json;
use rocket::serde::Serialize;
use rocket::{catch, catchers, delete, get, post, put, routes, Catcher, Request, Route, State};
use rocket_dyn_templates::Template;
use tracing::instrument;

use crate::error::{Error, Message};
use crate::payload::{Payload, RequestBody};
use crate::registry::{Entry, Key, Registry};
use crate::sd::TargetGroup;

type Response = Result<Json<Vec<TargetGroup>>, Error>;

pub fn routes() -> Vec<Route> {
    routes![index, get_targets, put_targets, post_targets, delete_targets]
}

pub fn catchers() -> Vec<Catcher> {
    catchers![registry_index, json_error]
}

fn respond(entry: Entry) -> Json<Vec<TargetGroup>> {
    Json(vec![entry.to_group()])
}

fn request(
    application: &str,
    environment: &str,
    body: Result<RequestBody, Error>,
) -> Result<(Key, Payload), Error> {
    let key = Key::new(application, environment)?;
    let payload = Payload::from_body(&body?)?;

    Ok((key, payload))
}

#[instrument(skip(registry))]
#[get("/<application>/<environment>")]
async fn get_targets(
    application: &str,
    environment: &str,
    registry: &State<Registry>,
) -> Json<Vec<TargetGroup>> {
    // an invalid pair can never have been registered
    let entry = match Key::new(application, environment) {
        Ok(key) => registry.get(&key).await,
        Err(_) => Entry::vacant(&Key::unchecked(application, environment)),
    };

    respond(entry)
}

#[instrument(skip(body, registry))]
#[put("/<application>/<environment>", data = "<body>")]
async fn put_targets(
    application: &str,
    environment: &str,
    body: Result<RequestBody, Error>,
    registry: &State<Registry>,
) -> Response {
    let (key, payload) = request(application, environment, body)?;
    Ok(respond(registry.put(key, payload).await?))
}

#[instrument(skip(body, registry))]
#[post("/<application>/<environment>", data = "<body>")]
async fn post_targets(
    application: &str,
    environment: &str,
    body: Result<RequestBody, Error>,
    registry: &State<Registry>,
) -> Response {
    let (key, payload) = request(application, environment, body)?;
    Ok(respond(registry.post(key, payload).await?))
}

#[instrument(skip(body, registry))]
#[delete("/<application>/<environment>", data = "<body>")]
async fn delete_targets(
    application: &str,
    environment: &str,
    body: Result<RequestBody, Error>,
    registry: &State<Registry>,
) -> Response {
    let (key, payload) = request(application, environment, body)?;
    Ok(respond(registry.delete(key, payload).await?))
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct IndexItem {
    application: String,
    environment: String,
}

async fn render_index(registry: Option<&Registry>) -> Template {
    let keys = match registry {
        Some(registry) => registry.keys().await,
        None => Vec::new(),
    };

    let items = keys
        .iter()
        .map(|key| IndexItem {
            application: key.application().to_string(),
            environment: key.environment().to_string(),
        })
        .collect::<Vec<_>>();

    Template::render("registry", rocket_dyn_templates::context! { keys: items })
}

#[get("/")]
async fn index(registry: &State<Registry>) -> content::RawHtml<Template> {
    content::RawHtml(render_index(Some(registry.inner())).await)
}

#[instrument(skip(req))]
#[catch(404)]
async fn registry_index(status: Status, req: &Request<'_>) -> (Status, content::RawHtml<Template>) {
    (
        status,
        content::RawHtml(render_index(req.rocket().state::<Registry>()).await),
    )
}

#[catch(default)]
fn json_error(status: Status, _req: &Request<'_>) -> (Status, Json<Message>) {
    (
        status,
        Json(Message {
            message: status.reason_lossy().to_string(),
        }),
    )
}
