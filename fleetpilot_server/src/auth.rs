use rocket::request::{FromRequest, Outcome, Request};

pub const ACTOR_HEADER: &str = "X-Fleet-Actor";
pub const DEFAULT_ACTOR: &str = "admin";

/// Administrator recorded in the activity log for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub String);

impl Actor {
    pub fn name(&self) -> &str {
        &self.0
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Actor {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let name = req
            .headers()
            .get_one(ACTOR_HEADER)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_ACTOR);
        Outcome::Success(Actor(name.to_string()))
    }
}
