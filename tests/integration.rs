//! Integration tests for callmesh.
//!
//! These tests drive dispatchers through real frames, over in-process
//! callers and loopback TCP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use callmesh::caller::{ChannelCaller, LocalCaller, NoCaller, ServiceCaller};
use callmesh::channel::{connect, Address, Listener};
use callmesh::codec::{Naming, PayloadCodec, Value};
use callmesh::command::{Command, CommandReply, CommandResult};
use callmesh::config::parse_definitions;
use callmesh::dispatch::{DispatchState, Dispatcher};
use callmesh::handler::{CallSpec, HandlerRegistry, RequestContext, Resources, Runtime};
use callmesh::param::Param;
use callmesh::protocol::{meta, read_frame, write_frame, Frame, FrameBuffer, Signal, Tag};
use callmesh::schema::{ActionSchema, ParamSchema, ParamType, SchemaTable};
use callmesh::transport::{
    ActionKey, CallRecord, ErrorRecord, FileRef, RelationKey, Transaction, TransactionKind,
    Transport,
};
use callmesh::version::resolve;
use callmesh::CallmeshError;

fn runtime(name: &str, version: &str, schema: SchemaTable, caller: Arc<dyn ServiceCaller>) -> Runtime {
    Runtime {
        name: name.into(),
        version: version.into(),
        framework_version: "1.0".into(),
        schema,
        caller,
        resources: Resources::new(),
        variables: BTreeMap::new(),
        file_server: None,
    }
}

fn request(target: ActionKey, params: Vec<Param>) -> Frame {
    let transport = Transport::new("req-1", target.clone());
    let command = Command::call(target.clone(), params, transport);
    let body = PayloadCodec::new()
        .encode(&command.to_value(Naming::Compact))
        .unwrap();
    Frame::request(target.action, vec![Bytes::from(body)])
}

fn decode_reply(frame: &Frame) -> (Transport, Option<Value>) {
    let value = PayloadCodec::new().decode(frame.body().unwrap()).unwrap();
    match CommandReply::from_value(&value).unwrap().result {
        CommandResult::Service {
            transport,
            return_value,
        } => (transport, return_value),
        other => panic!("unexpected result {:?}", other),
    }
}

/// Users 0.1 and 0.2, both with a `read` action echoing `id`.
fn users_dispatcher(caller: Arc<dyn ServiceCaller>, schema: SchemaTable) -> Dispatcher {
    let mut schema = schema;
    let mut registry = HandlerRegistry::new();
    for version in ["0.1", "0.2"] {
        schema.register(
            "users",
            version,
            ActionSchema::new("read").param(ParamSchema::new("id", ParamType::Integer).required()),
        );
        let tag = version.to_string();
        registry.register(
            ActionKey::new("users", version, "read"),
            move |mut ctx: RequestContext| {
                let tag = tag.clone();
                async move {
                    let id = ctx.get_param("id").map(|p| p.value.clone()).unwrap_or_default();
                    ctx.set_entity(Value::from_pairs([
                        ("id", id),
                        ("served_by", Value::from(tag)),
                    ]))?;
                    Ok(ctx)
                }
            },
        );
    }
    Dispatcher::new(runtime("users", "0.2", schema, caller), registry)
}

/// Posts 1.0 with a `count` action returning an integer.
fn posts_dispatcher() -> Dispatcher {
    let mut schema = SchemaTable::new();
    schema.register(
        "posts",
        "1.0",
        ActionSchema::new("count").returns(ParamType::Integer),
    );
    schema.register("posts", "1.0", ActionSchema::new("slow"));

    let mut registry = HandlerRegistry::new();
    registry.register(ActionKey::new("posts", "1.0", "count"), |mut ctx| async move {
        ctx.set_collection(vec![
            Value::from_pairs([("id", Value::Int(1))]),
            Value::from_pairs([("id", Value::Int(2))]),
        ])?;
        ctx.set_return(Value::Int(2))?;
        ctx.set_link("self", "/posts");
        Ok(ctx)
    });
    registry.register(ActionKey::new("posts", "1.0", "slow"), |ctx| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ctx)
    });

    Dispatcher::new(runtime("posts", "1.0", schema, Arc::new(NoCaller)), registry)
}

/// Users 1.0 with a `profile` action that counts the user's posts.
fn profile_dispatcher(caller: Arc<dyn ServiceCaller>, posts_address: Option<String>) -> Dispatcher {
    let mut schema = SchemaTable::new();
    schema.register("users", "1.0", ActionSchema::new("profile"));
    schema.register(
        "posts",
        "1.0",
        ActionSchema::new("count").returns(ParamType::Integer),
    );
    schema.register("posts", "1.0", ActionSchema::new("slow"));
    schema.register_service("posts", "1.0", posts_address, false);

    let mut registry = HandlerRegistry::new();
    registry.register(ActionKey::new("users", "1.0", "profile"), |mut ctx| async move {
        let posts = ctx.call("posts", "1.*", "count", vec![]).await?;
        let slow = ctx
            .call_spec(CallSpec::new("posts", "1.0", "slow").timeout(Duration::from_millis(20)))
            .await;
        ctx.set_entity(Value::from_pairs([
            ("posts", posts.unwrap_or_default()),
            ("slow_failed", Value::Bool(slow.is_err())),
        ]))?;
        Ok(ctx)
    });

    Dispatcher::new(runtime("users", "1.0", schema, caller), registry)
}

#[test]
fn test_version_resolution_cases() {
    let versions = ["0.1", "0.2", "0.10", "1.0"];
    assert_eq!(resolve("users", "0.*", versions).unwrap(), "0.10");
    assert_eq!(resolve("users", "*", versions).unwrap(), "1.0");
    assert_eq!(resolve("users", "0.2", versions).unwrap(), "0.2");
    assert!(matches!(
        resolve("users", "2.*", versions),
        Err(CallmeshError::NoVersionMatch { .. })
    ));
    assert!(resolve("users", "0.*", []).is_err());

    assert_eq!(resolve("users", "1.*", ["1.0", "1.2", "2.0"]).unwrap(), "1.2");
    assert_eq!(
        resolve("users", "1.*.3", ["1.2.3", "1.5.3", "1.5.4"]).unwrap(),
        "1.5.3"
    );
    assert!(resolve("users", "1.0", ["2.0"]).is_err());
}

#[tokio::test]
async fn test_users_read_scenario() {
    let mut schema = SchemaTable::new();
    schema.register(
        "users",
        "0.1",
        ActionSchema::new("read").param(ParamSchema::new("id", ParamType::Integer).required()),
    );
    let mut registry = HandlerRegistry::new();
    registry.register(ActionKey::new("users", "0.1", "read"), |mut ctx| async move {
        let id = ctx.get_param("id").map(|p| p.value.clone()).unwrap_or_default();
        ctx.set_entity(Value::from_pairs([("id", id), ("name", Value::from("foobar"))]))?;
        Ok(ctx)
    });
    let dispatcher = Dispatcher::new(runtime("users", "0.1", schema, Arc::new(NoCaller)), registry);

    let outcome = dispatcher
        .process(request(ActionKey::new("users", "0.*", "read"), vec![Param::new("id", 42)]))
        .await;
    let (transport, _) = decode_reply(&outcome.frame.unwrap());

    assert!(!transport.has_errors());
    assert_eq!(
        transport.get_data(&ActionKey::new("users", "0.1", "read")),
        Some(&Value::from_pairs([
            ("id", Value::Int(42)),
            ("name", Value::from("foobar")),
        ]))
    );
}

#[test]
fn test_merge_grouping_does_not_change_result() {
    let base = Transport::new("req-1", ActionKey::new("users", "1.0", "read"));
    let fragment = |service: &str, n: i64| {
        let mut f = base.fragment();
        f.set_data(ActionKey::new(service, "1.0", "read"), Value::Int(n));
        f.add_link(service, "self", format!("/{}", service));
        f
    };
    let (a, b, c) = (fragment("a", 1), fragment("b", 2), fragment("c", 3));

    let mut left = base.clone();
    let mut ab = a.clone();
    ab.merge_into(b.clone());
    left.merge_into(ab);
    left.merge_into(c.clone());

    let mut right = base.clone();
    let mut bc = b;
    bc.merge_into(c);
    right.merge_into(a);
    right.merge_into(bc);

    assert_eq!(left.data(), right.data());
    assert_eq!(left.links(), right.links());
    assert_eq!(left.data().len(), 3);
}

/// Overlapping keys resolve to the fragment merged last; appended fields
/// keep merge order. Both groupings give the same Transport.
#[test]
fn test_merge_grouping_with_overlapping_keys() {
    let base = Transport::new("req-1", ActionKey::new("users", "1.0", "read"));
    let shared = ActionKey::new("shared", "1.0", "read");
    let relation = RelationKey {
        service: "users".into(),
        primary_key: "42".into(),
        address: "ktp://gateway:80".into(),
        foreign_service: "posts".into(),
    };
    let fragment = |service: &str, n: i64| {
        let target = ActionKey::new(service, "1.0", "read");
        let mut f = base.fragment();
        f.set_data(shared.clone(), Value::Int(n));
        f.add_error(shared.clone(), ErrorRecord::new(service, n, "500 Internal Server Error"));
        f.set_relation(relation.clone(), Value::Int(n));
        f.set_property("last", service);
        f.push_call(CallRecord::new(base.meta.origin.clone(), target.clone()));
        f.add_file(target, FileRef::new("report", format!("http://files/{}.pdf", service), "application/pdf"));
        f.add_link(service, "self", format!("/{}", service));
        f.add_transaction(Transaction {
            kind: TransactionKind::Commit,
            service: service.into(),
            version: "1.0".into(),
            caller: "read".into(),
            action: "save".into(),
            params: vec![],
        });
        f
    };
    let (a, b, c) = (fragment("a", 1), fragment("b", 2), fragment("c", 3));

    let mut left = base.clone();
    let mut ab = a.clone();
    ab.merge_into(b.clone());
    left.merge_into(ab);
    left.merge_into(c.clone());

    let mut right = base.clone();
    let mut bc = b;
    bc.merge_into(c);
    right.merge_into(a);
    right.merge_into(bc);

    assert_eq!(left, right);

    assert_eq!(left.data().len(), 1);
    assert_eq!(left.get_data(&shared), Some(&Value::Int(3)));
    assert_eq!(left.errors()[&shared], [ErrorRecord::new("c", 3, "500 Internal Server Error")]);
    assert_eq!(left.relations()[&relation], Value::Int(3));
    assert_eq!(left.meta.properties["last"], "c");

    let order = |items: Vec<&str>| items.join(",");
    assert_eq!(order(left.calls().iter().map(|c| c.target.service.as_str()).collect()), "a,b,c");
    assert_eq!(order(left.links().iter().map(|l| l.service.as_str()).collect()), "a,b,c");
    assert_eq!(order(left.transactions().iter().map(|t| t.service.as_str()).collect()), "a,b,c");
    assert_eq!(left.files().len(), 3);
}

#[test]
fn test_definitions_drive_resolution() {
    let mut table = SchemaTable::new();
    parse_definitions(
        r#"
[[service]]
name = "users"
version = "0.1"

[[service.action]]
name = "read"

[[service]]
name = "users"
version = "0.3"

[[service.action]]
name = "list"
"#,
        &mut table,
    )
    .unwrap();

    let (version, schema) = table.resolve_action("users", "0.*", "read").unwrap();
    assert_eq!(version, "0.1");
    assert_eq!(schema.name, "read");
    assert!(matches!(
        table.resolve_action("users", "0.*", "delete"),
        Err(CallmeshError::ActionNotFound { .. })
    ));
}

#[test]
fn test_fragmented_frame_parsing() {
    let frame = request(ActionKey::new("users", "0.*", "read"), vec![Param::new("id", 42)]);
    let bytes = frame.encode().unwrap();

    let mut buffer = FrameBuffer::new();
    let mut frames = Vec::new();
    for chunk in bytes.chunks(3) {
        frames.extend(buffer.push(chunk).unwrap());
    }
    assert_eq!(frames, vec![frame]);
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn test_read_over_stream() {
    let (mut client, mut server) = tokio::io::duplex(4096);
    let frame = request(ActionKey::new("users", "0.*", "read"), vec![Param::new("id", 42)]);

    write_frame(&mut client, &frame).await.unwrap();
    let received = read_frame(&mut server).await.unwrap();
    assert_eq!(received.action(), Some("read"));

    let dispatcher = users_dispatcher(Arc::new(NoCaller), SchemaTable::new());
    let outcome = dispatcher.process(received).await;
    assert_eq!(outcome.state, DispatchState::Idle);

    let (transport, _) = decode_reply(&outcome.frame.unwrap());
    let data = transport
        .get_data(&ActionKey::new("users", "0.2", "read"))
        .unwrap();
    assert_eq!(data.get("id"), Some(&Value::Int(42)));
    assert_eq!(data.get("served_by"), Some(&Value::from("0.2")));
}

#[tokio::test]
async fn test_serve_end_to_end_over_tcp() {
    let dispatcher = Arc::new(users_dispatcher(Arc::new(NoCaller), SchemaTable::new()));
    let listener = Listener::bind(&Address::Tcp("127.0.0.1:0".into())).await.unwrap();
    let address = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(dispatcher.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let mut connection = connect(&address).await.unwrap();

    // ping
    let ping = Frame::control(vec![Bytes::from_static(b"client-1")], Signal::Ping);
    write_frame(&mut connection, &ping).await.unwrap();
    let pong = read_frame(&mut connection).await.unwrap();
    assert_eq!(pong.tag, Tag::Control(Signal::Pong));
    assert_eq!(pong.identity, ping.identity);

    // read id=42 against 0.*
    let mut frame = request(ActionKey::new("users", "0.*", "read"), vec![Param::new("id", 42)]);
    frame.identity = vec![Bytes::from_static(b"client-1")];
    write_frame(&mut connection, &frame).await.unwrap();
    let reply = read_frame(&mut connection).await.unwrap();

    assert_eq!(reply.identity, frame.identity);
    assert_eq!(reply.tag, Tag::Response(vec![meta::EMPTY]));
    let (transport, return_value) = decode_reply(&reply);
    assert!(return_value.is_none());
    assert!(!transport.has_errors());
    assert_eq!(
        transport
            .get_data(&ActionKey::new("users", "0.2", "read"))
            .and_then(|d| d.get("id")),
        Some(&Value::Int(42))
    );

    // missing required id
    write_frame(&mut connection, &request(ActionKey::new("users", "0.1", "read"), vec![]))
        .await
        .unwrap();
    let reply = read_frame(&mut connection).await.unwrap();
    let (transport, _) = decode_reply(&reply);
    let errors = &transport.errors()[&ActionKey::new("users", "0.1", "read")];
    assert!(errors[0].status.starts_with("400"));

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_downstream_call_through_local_caller() {
    let posts = Arc::new(posts_dispatcher());
    let users = profile_dispatcher(Arc::new(LocalCaller::new(posts)), None);

    let outcome = users
        .process(request(ActionKey::new("users", "1.0", "profile"), vec![]))
        .await;
    let (transport, _) = decode_reply(&outcome.frame.unwrap());

    let profile = transport
        .get_data(&ActionKey::new("users", "1.0", "profile"))
        .unwrap();
    assert_eq!(profile.get("posts"), Some(&Value::Int(2)));
    assert_eq!(profile.get("slow_failed"), Some(&Value::Bool(true)));

    let posts_data = transport
        .get_data(&ActionKey::new("posts", "1.0", "count"))
        .unwrap();
    assert_eq!(posts_data.as_array().map(Vec::len), Some(2));
    assert_eq!(transport.links().len(), 1);

    let targets: Vec<_> = transport.calls().iter().map(|c| c.target.action.clone()).collect();
    assert_eq!(targets, vec!["count".to_string(), "slow".to_string()]);
}

#[tokio::test]
async fn test_downstream_call_over_tcp() {
    let posts = Arc::new(posts_dispatcher());
    let listener = Listener::bind(&Address::Tcp("127.0.0.1:0".into())).await.unwrap();
    let posts_address = listener.local_addr().unwrap().to_string();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(posts.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let users = profile_dispatcher(Arc::new(ChannelCaller::default()), Some(posts_address));
    let outcome = users
        .process(request(ActionKey::new("users", "1.0", "profile"), vec![]))
        .await;
    let (transport, _) = decode_reply(&outcome.frame.unwrap());

    let profile = transport
        .get_data(&ActionKey::new("users", "1.0", "profile"))
        .unwrap();
    assert_eq!(profile.get("posts"), Some(&Value::Int(2)));
    assert!(transport
        .get_data(&ActionKey::new("posts", "1.0", "count"))
        .is_some());

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_call_without_address_fails() {
    let users = profile_dispatcher(Arc::new(ChannelCaller::default()), None);
    let outcome = users
        .process(request(ActionKey::new("users", "1.0", "profile"), vec![]))
        .await;
    let (transport, _) = decode_reply(&outcome.frame.unwrap());

    assert!(transport
        .get_data(&ActionKey::new("users", "1.0", "profile"))
        .is_none());
    assert!(transport
        .errors()
        .contains_key(&ActionKey::new("users", "1.0", "profile")));
}

#[tokio::test(start_paused = true)]
async fn test_pending_handler_times_out() {
    let posts = posts_dispatcher().with_timeout(Duration::from_millis(50));
    let outcome = posts
        .process(request(ActionKey::new("posts", "1.0", "slow"), vec![]))
        .await;
    assert_eq!(outcome.state, DispatchState::Idle);

    let (transport, _) = decode_reply(&outcome.frame.unwrap());
    let errors = &transport.errors()[&ActionKey::new("posts", "1.0", "slow")];
    assert!(errors[0].status.starts_with("504"));
}
