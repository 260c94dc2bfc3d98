//! A small users service.
//!
//! Serve on TCP:
//!
//! ```text
//! cargo run --example users_service -- -n users -v 0.1 -t 127.0.0.1:5010
//! ```
//!
//! Run one request and print the reply:
//!
//! ```text
//! echo '{"command": {"name": "read", "arguments": {"params": [{"name": "id", "value": 42}]}}}' \
//!     | cargo run --example users_service -- -n users -v 0.1 -A read
//! ```

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Mutex;

use serde::Deserialize;

use callmesh::handler::RequestContext;
use callmesh::schema::{ActionSchema, ParamLocation, ParamSchema, ParamType};
use callmesh::{Component, HandlerError, Value};

struct Directory {
    users: Mutex<HashMap<i64, String>>,
}

impl Directory {
    fn seeded() -> Self {
        let users = [(1, "ada"), (42, "grace")]
            .into_iter()
            .map(|(id, name)| (id, name.to_string()))
            .collect();
        Self {
            users: Mutex::new(users),
        }
    }
}

#[derive(Deserialize)]
struct CreateUser {
    id: i64,
    name: String,
}

fn user(id: i64, name: &str) -> Value {
    Value::from_pairs([("id", Value::Int(id)), ("name", Value::from(name))])
}

async fn read(mut ctx: RequestContext) -> Result<RequestContext, HandlerError> {
    let directory = ctx
        .resource::<Directory>()
        .ok_or_else(|| HandlerError::new("directory unavailable"))?;
    let id = ctx
        .get_param("id")
        .and_then(|p| p.value.as_i64())
        .unwrap_or_default();

    let name = directory
        .users
        .lock()
        .map_err(|_| HandlerError::new("directory poisoned"))?
        .get(&id)
        .cloned();
    match name {
        Some(name) => {
            ctx.set_entity(user(id, &name))?;
            ctx.set_link("self", format!("/users/{}", id));
            ctx.relate_one(&id.to_string(), "posts", "1");
        }
        None => ctx.error(format!("User {} not found", id), 1, Some("404 Not Found")),
    }
    Ok(ctx)
}

async fn create(input: CreateUser, mut ctx: RequestContext) -> Result<RequestContext, HandlerError> {
    let directory = ctx
        .resource::<Directory>()
        .ok_or_else(|| HandlerError::new("directory unavailable"))?;
    directory
        .users
        .lock()
        .map_err(|_| HandlerError::new("directory poisoned"))?
        .insert(input.id, input.name.clone());

    ctx.set_entity(user(input.id, &input.name))?;
    ctx.set_return(Value::Bool(true))?;
    ctx.rollback("delete", vec![callmesh::Param::new("id", input.id)]);
    Ok(ctx)
}

fn main() -> ExitCode {
    Component::new()
        .resource(Directory::seeded())
        .schema(
            ActionSchema::new("read")
                .param(
                    ParamSchema::new("id", ParamType::Integer)
                        .required()
                        .location(ParamLocation::Path),
                )
                .http("get", "/users/{id}"),
        )
        .schema(
            ActionSchema::new("create")
                .param(ParamSchema::new("id", ParamType::Integer).required())
                .param(ParamSchema::new("name", ParamType::String).required())
                .returns(ParamType::Boolean),
        )
        .action("read", read)
        .typed_action("create", create)
        .on_startup(|runtime| {
            tracing::info!(name = %runtime.name, version = %runtime.version, "Users service ready");
            Ok(())
        })
        .on_error(|action, err| tracing::error!(%action, %err, "Action failed"))
        .run()
}
