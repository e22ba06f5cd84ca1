//! Scenarios that exercise the guarantees every carrier must provide. Each returns `Ok(())` if the
//!  observed events match the expectations, and an error describing the first deviation
//!  otherwise. Wrap them in [super::run_with_deadline] to turn hangs into failures.

use anyhow::ensure;
use bytes::Bytes;
use tracing::debug;

use crate::address::EndPointAddress;
use crate::echo::echo_server;
use crate::end_point::EndPoint;
use crate::event::{ConnectionId, Event, Reliability};
use crate::expect_event;
use crate::transport::{Transport, TransportExt};

/// A client pings an echo service `num_pings` times, waiting for each reply.
pub async fn ping_echo(transport: &dyn Transport, num_pings: usize) -> anyhow::Result<()> {
    let echo = transport.spawn(echo_server).await?;
    let client = transport.new_endpoint().await?;

    ping(&client, &echo, b"ping", num_pings).await?;
    client.close().await;
    Ok(())
}

/// Two clients ping the same echo service concurrently, each seeing only its own replies.
pub async fn end_point_isolation(transport: &dyn Transport, num_pings: usize) -> anyhow::Result<()> {
    let echo = transport.spawn(echo_server).await?;
    let client_a = transport.new_endpoint().await?;
    let client_b = transport.new_endpoint().await?;

    tokio::try_join!(
        ping(&client_a, &echo, b"pingA", num_pings),
        ping(&client_b, &echo, b"pingB", num_pings),
    )?;

    client_a.close().await;
    client_b.close().await;
    Ok(())
}

/// Connects to `server` and sends `payload` `num_pings` times, expecting each one echoed back on
///  the connection the server opens in the other direction.
pub async fn ping(end_point: &EndPoint, server: &EndPointAddress, payload: &[u8], num_pings: usize) -> anyhow::Result<()> {
    let connection = end_point.connect(server, Reliability::ReliableOrdered).await?;

    // the echo service opens its reply connection before it can echo anything
    let reply_id = expect_event!(end_point, Event::ConnectionOpened(data) if &data.from == server => data.id);

    let message = [Bytes::copy_from_slice(payload)];
    for i in 0..num_pings {
        connection.send(&message).await?;
        let reply = expect_event!(end_point, Event::Received(data) if data.id == reply_id => data.payload);
        ensure!(reply == message, "ping #{}: sent {:?}, got {:?}", i, message, reply);
    }

    connection.close().await;
    expect_event!(end_point, Event::ConnectionClosed(id) if id == reply_id => ());
    debug!("{:?}: {} pings done", end_point.address(), num_pings);
    Ok(())
}

async fn expect_two_connections(server: &EndPoint) -> anyhow::Result<(ConnectionId, ConnectionId)> {
    let first = expect_event!(server, Event::ConnectionOpened(data) => data.id);
    let second = expect_event!(server, Event::ConnectionOpened(data) => data.id);
    ensure!(first != second, "two connections were assigned the same id {:?}", first);
    Ok((first, second))
}

/// One end point opens two connections to the same peer and sends on both; the peer must see each
///  message tagged with the id of the connection it was sent on.
pub async fn connection_multiplexing(transport: &dyn Transport, num_pings: usize) -> anyhow::Result<()> {
    let server = transport.new_endpoint().await?;
    let client = transport.new_endpoint().await?;
    let ping_a = [Bytes::from_static(b"pingA")];
    let ping_b = [Bytes::from_static(b"pingB")];

    let verify = async {
        let (serv1, serv2) = expect_two_connections(&server).await?;

        let mut count1 = 0;
        let mut count2 = 0;
        for _ in 0..2*num_pings {
            let data = expect_event!(server, Event::Received(data) => data);
            if data.id == serv1 {
                ensure!(data.payload == ping_a, "{:?} got {:?}", serv1, data.payload);
                count1 += 1;
            }
            else if data.id == serv2 {
                ensure!(data.payload == ping_b, "{:?} got {:?}", serv2, data.payload);
                count2 += 1;
            }
            else {
                anyhow::bail!("message for unknown connection {:?}", data.id);
            }
        }
        ensure!(count1 == num_pings && count2 == num_pings, "expected {} messages per connection, got {} / {}", num_pings, count1, count2);
        Ok::<_, anyhow::Error>(())
    };

    let send = async {
        let conn1 = client.connect(server.address(), Reliability::ReliableOrdered).await?;
        let conn2 = client.connect(server.address(), Reliability::ReliableOrdered).await?;
        for _ in 0..num_pings {
            conn1.send(&ping_a).await?;
            conn2.send(&ping_b).await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(verify, send)?;
    client.close().await;
    server.close().await;
    Ok(())
}

/// Like [connection_multiplexing], but the first connection is closed halfway while the second
///  one carries on for twice as many messages.
pub async fn partial_close(transport: &dyn Transport, num_pings: usize) -> anyhow::Result<()> {
    let server = transport.new_endpoint().await?;
    let client = transport.new_endpoint().await?;
    let ping_a = [Bytes::from_static(b"pingA")];
    let ping_b = [Bytes::from_static(b"pingB")];

    let verify = async {
        let (serv1, serv2) = expect_two_connections(&server).await?;

        let mut count1 = 0;
        let mut count2 = 0;
        let mut serv1_closed = false;
        while !serv1_closed || count2 < 3*num_pings {
            match server.receive().await {
                Event::Received(data) if data.id == serv1 => {
                    ensure!(!serv1_closed, "message for {:?} after it was closed", serv1);
                    ensure!(data.payload == ping_a, "{:?} got {:?}", serv1, data.payload);
                    count1 += 1;
                }
                Event::Received(data) if data.id == serv2 => {
                    ensure!(data.payload == ping_b, "{:?} got {:?}", serv2, data.payload);
                    count2 += 1;
                }
                Event::ConnectionClosed(id) if id == serv1 && !serv1_closed => {
                    ensure!(count1 == num_pings, "{:?} was closed after {} of {} messages", serv1, count1, num_pings);
                    serv1_closed = true;
                }
                other => anyhow::bail!("unexpected event {:?}", other),
            }
        }
        ensure!(count2 == 3*num_pings, "expected {} messages on {:?}, got {}", 3*num_pings, serv2, count2);
        Ok::<_, anyhow::Error>(())
    };

    let send = async {
        let conn1 = client.connect(server.address(), Reliability::ReliableOrdered).await?;
        let conn2 = client.connect(server.address(), Reliability::ReliableOrdered).await?;
        for _ in 0..num_pings {
            conn1.send(&ping_a).await?;
            conn2.send(&ping_b).await?;
        }
        conn1.close().await;
        for _ in 0..2*num_pings {
            conn2.send(&ping_b).await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(verify, send)?;
    client.close().await;
    server.close().await;
    Ok(())
}

/// Sends numbered multi-fragment messages on a single connection: the receiver must see exactly
///  the same sequence with fragment boundaries intact, followed by the connection's close.
pub async fn send_order(transport: &dyn Transport, num_messages: usize) -> anyhow::Result<()> {
    let server = transport.new_endpoint().await?;
    let client = transport.new_endpoint().await?;

    let message = |i: usize| vec![
        Bytes::from_static(b"seq"),
        Bytes::from(i.to_string()),
        Bytes::new(),
    ];

    let connection = client.connect(server.address(), Reliability::ReliableOrdered).await?;
    let send = async {
        for i in 0..num_messages {
            connection.send(&message(i)).await?;
        }
        connection.close().await;
        Ok::<_, anyhow::Error>(())
    };

    let verify = async {
        let id = expect_event!(server, Event::ConnectionOpened(data) => data.id);
        for i in 0..num_messages {
            let payload = expect_event!(server, Event::Received(data) if data.id == id => data.payload);
            ensure!(payload == message(i), "message #{}: got {:?}", i, payload);
        }
        expect_event!(server, Event::ConnectionClosed(closed) if closed == id => ());
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(send, verify)?;
    client.close().await;
    server.close().await;
    Ok(())
}

/// Two fresh end points each accept one connection, so they typically hand out the same
///  connection id. Messages must still go to the end point they were sent to.
pub async fn connection_id_scoping(transport: &dyn Transport, num_pings: usize) -> anyhow::Result<()> {
    let server1 = transport.new_endpoint().await?;
    let server2 = transport.new_endpoint().await?;
    let client = transport.new_endpoint().await?;
    let to1 = [Bytes::from_static(b"to1")];
    let to2 = [Bytes::from_static(b"to2")];

    let conn1 = client.connect(server1.address(), Reliability::ReliableOrdered).await?;
    let conn2 = client.connect(server2.address(), Reliability::ReliableOrdered).await?;
    let id1 = expect_event!(server1, Event::ConnectionOpened(data) if &data.from == client.address() => data.id);
    let id2 = expect_event!(server2, Event::ConnectionOpened(data) if &data.from == client.address() => data.id);
    debug!("connection ids: {:?} / {:?}", id1, id2);

    for _ in 0..num_pings {
        conn1.send(&to1).await?;
        conn2.send(&to2).await?;
    }

    for (server, id, expected) in [(&server1, id1, &to1), (&server2, id2, &to2)] {
        for i in 0..num_pings {
            let payload = expect_event!(server, Event::Received(data) if data.id == id => data.payload);
            ensure!(payload == expected, "{:?} message #{}: got {:?}", server.address(), i, payload);
        }
    }

    client.close().await;
    expect_event!(server1, Event::ConnectionClosed(id) if id == id1 => ());
    expect_event!(server2, Event::ConnectionClosed(id) if id == id2 => ());
    server1.close().await;
    server2.close().await;
    Ok(())
}
