mod utils;

use std::{rc::Rc, time::Duration};

use anyhow::Error;
use tracing_test::traced_test;
use wharf::World;
use wharf_websocket::{close_code, Groups, Liveness, OpCode};

use crate::utils::{
    client_frame, close_payload, given_connection, given_upgraded, given_websocket_server,
    upgrade_request, when_peer_closed, when_received, ChatFactory, EchoFactory, Log, ACCEPT,
};

fn given_echo(log: &Log, liveness: Liveness) -> Rc<wharf_http::server::ServerConfig> {
    let echo = EchoFactory {
        log: log.clone(),
        liveness,
    };
    Rc::new(given_websocket_server(vec![Rc::new(echo)], None))
}

#[test]
#[traced_test]
fn handshake_switches_to_websocket() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let connection = given_connection(&mut world, given_echo(&log, Liveness::disabled()))?;

    // A text frame directly after the request is handled by the new protocol
    let mut data = upgrade_request("unknown, echo").into_bytes();
    data.extend(client_frame(true, OpCode::Text, b"early"));
    when_received(&mut world, &connection, &data)?;

    let mut event = connection.next_request().expect("no request");
    event.response.upgrade(&event.request)?;
    world.run_until_idle()?;

    let mut output = connection.take_output();
    let head = output.take_head();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Upgrade: websocket\r\n"));
    assert!(head.contains("Connection: Upgrade\r\n"));
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {}\r\n", ACCEPT)));
    assert!(head.contains("Sec-WebSocket-Protocol: echo\r\n"));

    assert_eq!(output.frames(), [(OpCode::Text, b"early".to_vec())]);
    assert_eq!(*log.borrow(), ["connected echo", "message early"]);

    Ok(())
}

#[test]
#[traced_test]
fn wrong_version_is_refused() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let connection = given_connection(&mut world, given_echo(&log, Liveness::disabled()))?;

    let request = upgrade_request("echo").replace("Version: 13", "Version: 8");
    when_received(&mut world, &connection, request.as_bytes())?;

    let mut event = connection.next_request().expect("no request");
    assert!(event.response.upgrade(&event.request).is_err());
    world.run_until_idle()?;

    let mut output = connection.take_output();
    let head = output.take_head();
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert!(output.shutdown);
    assert!(log.borrow().is_empty());

    Ok(())
}

#[test]
#[traced_test]
fn unsupported_sub_protocol_is_refused() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let connection = given_connection(&mut world, given_echo(&log, Liveness::disabled()))?;

    when_received(&mut world, &connection, upgrade_request("mqtt").as_bytes())?;

    let mut event = connection.next_request().expect("no request");
    assert!(event.response.upgrade(&event.request).is_err());
    world.run_until_idle()?;

    let head = connection.take_output().take_head();
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    Ok(())
}

#[test]
#[traced_test]
fn fragmented_message_with_ping_in_between() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let connection = given_upgraded(&mut world, given_echo(&log, Liveness::disabled()), "echo")?;

    let mut data = client_frame(false, OpCode::Binary, b"abc");
    data.extend(client_frame(true, OpCode::Ping, b"still there?"));
    data.extend(client_frame(true, OpCode::Continuation, b"def"));
    when_received(&mut world, &connection, &data)?;

    let frames = connection.take_output().frames();
    assert_eq!(
        frames,
        [
            (OpCode::Pong, b"still there?".to_vec()),
            (OpCode::Binary, b"abcdef".to_vec()),
        ]
    );

    Ok(())
}

#[test]
#[traced_test]
fn unmasked_frame_closes_with_protocol_error() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let connection = given_upgraded(&mut world, given_echo(&log, Liveness::disabled()), "echo")?;

    // Servers send unmasked frames, clients may not
    let unmasked = [0x81, 0x02, b'h', b'i'];
    when_received(&mut world, &connection, &unmasked)?;

    let frames = connection.take_output().frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, OpCode::Close);
    assert_eq!(frames[0].1[..2], close_code::PROTOCOL_ERROR.to_be_bytes());
    assert!(log.borrow().contains(&"error 1002".to_string()));

    Ok(())
}

#[test]
#[traced_test]
fn peer_close_is_answered() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let connection = given_upgraded(&mut world, given_echo(&log, Liveness::disabled()), "echo")?;

    let payload = close_payload(close_code::NORMAL, "bye");
    when_received(&mut world, &connection, &client_frame(true, OpCode::Close, &payload))?;

    let output = connection.take_output();
    assert_eq!(output.frames(), [(OpCode::Close, payload)]);
    assert!(output.shutdown);

    when_peer_closed(&mut world, &connection)?;
    assert!(connection.is_closed());
    assert_eq!(log.borrow().last().map(String::as_str), Some("disconnected"));

    Ok(())
}

#[test]
#[traced_test]
fn unanswered_pings_close_connection() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let liveness = Liveness {
        ping_interval: Duration::from_secs(1),
        max_flying_pings: 2,
    };
    let connection = given_upgraded(&mut world, given_echo(&log, liveness), "echo")?;
    let start = world.now();

    for seconds in 1..=2 {
        world.advance_to(start + Duration::from_secs(seconds));
        world.run_until_idle()?;
        assert_eq!(connection.take_output().frames(), [(OpCode::Ping, Vec::new())]);
    }

    world.advance_to(start + Duration::from_secs(3));
    world.run_until_idle()?;

    let frames = connection.take_output().frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, OpCode::Close);
    assert_eq!(frames[0].1, close_code::GOING_AWAY.to_be_bytes());
    assert!(logs_contain("peer stopped answering pings"));

    // The peer never confirms the close
    world.advance_to(start + Duration::from_secs(14));
    world.run_until_idle()?;

    assert!(connection.take_output().close);
    assert!(connection.is_closed());

    Ok(())
}

#[test]
#[traced_test]
fn pong_resets_flying_pings() -> Result<(), Error> {
    let mut world = World::default();
    let log = Log::default();
    let liveness = Liveness {
        ping_interval: Duration::from_secs(1),
        max_flying_pings: 1,
    };
    let connection = given_upgraded(&mut world, given_echo(&log, liveness), "echo")?;
    let start = world.now();

    for seconds in 1..=3 {
        world.advance_to(start + Duration::from_secs(seconds));
        world.run_until_idle()?;
        assert_eq!(connection.take_output().frames(), [(OpCode::Ping, Vec::new())]);

        when_received(&mut world, &connection, &client_frame(true, OpCode::Pong, b""))?;
    }

    assert_eq!(log.borrow().iter().filter(|entry| *entry == "pong").count(), 3);

    Ok(())
}

#[test]
#[traced_test]
fn broadcast_reaches_group_except_sender() -> Result<(), Error> {
    let mut world = World::default();
    let groups = Rc::new(Groups::new());
    let config = Rc::new(given_websocket_server(
        vec![Rc::new(ChatFactory)],
        Some(groups.clone()),
    ));

    let alice = given_upgraded(&mut world, config.clone(), "chat")?;
    let bob = given_upgraded(&mut world, config.clone(), "chat")?;
    let carol = given_upgraded(&mut world, config, "chat")?;
    assert_eq!(groups.member_count("chat/chat"), 3);

    when_received(&mut world, &alice, &client_frame(true, OpCode::Text, b"hi all"))?;

    let hi = [(OpCode::Text, b"hi all".to_vec())];
    assert!(alice.take_output().frames().is_empty());
    assert_eq!(bob.take_output().frames(), hi);
    assert_eq!(carol.take_output().frames(), hi);

    // Joining another group leaves the default one
    when_received(&mut world, &carol, &client_frame(true, OpCode::Text, b"/join quiet"))?;
    assert_eq!(groups.member_count("chat/chat"), 2);
    assert_eq!(groups.member_count("chat/quiet"), 1);

    when_received(&mut world, &bob, &client_frame(true, OpCode::Text, b"where is carol"))?;
    assert_eq!(alice.take_output().frames().len(), 1);
    assert!(carol.take_output().frames().is_empty());

    // Joining the current group again changes nothing
    when_received(&mut world, &carol, &client_frame(true, OpCode::Text, b"/join quiet"))?;
    assert_eq!(groups.member_count("chat/quiet"), 1);

    when_peer_closed(&mut world, &carol)?;
    assert_eq!(groups.member_count("chat/quiet"), 0);
    assert_eq!(groups.channels(), ["chat/chat"]);

    when_peer_closed(&mut world, &alice)?;
    when_peer_closed(&mut world, &bob)?;
    assert!(groups.is_empty());

    Ok(())
}
