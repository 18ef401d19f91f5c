//! In-process mock relay daemon for integration tests.
//!
//! Speaks the real wire protocol through the crate's own codec and routes
//! between every connected client: app-scoped broadcasts and requests,
//! topic-scoped publishes, and tunnel pairing with id translation. Tunnel
//! route keys come in pairs (one per direction) so self-tunnels — both ends on
//! the same connection — stay unambiguous.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use relay_link::config::{MAGIC_BYTES, PROTOCOL_VERSION};
use relay_link::core::codec::PacketCodec;
use relay_link::core::packet::Packet;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

struct ClientEntry {
    app: String,
    accepts_inbound: bool,
    tx: mpsc::UnboundedSender<Packet>,
}

struct RouteEntry {
    dest_client: u64,
    dest_tunnel: u64,
    partner_key: u64,
}

struct PendingTunnel {
    initiator: u64,
    initiator_tunnel: u64,
    initiator_key: u64,
}

#[derive(Default)]
struct RelayState {
    next_client: u64,
    next_request: u64,
    next_route: u64,
    clients: HashMap<u64, ClientEntry>,
    apps: HashMap<String, Vec<u64>>,
    topics: HashMap<String, Vec<u64>>,
    requests: HashMap<u64, (u64, u64)>,
    pending_tunnels: HashMap<u64, PendingTunnel>,
    tunnels: HashMap<u64, RouteEntry>,
}

/// A relay daemon bound to an ephemeral loopback port. Dropping it kills
/// every client socket, which the binding observes as a connection drop.
pub struct MockRelay {
    port: u16,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind mock relay");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(RelayState::default()));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_tasks = Arc::clone(&tasks);
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                stream.set_nodelay(true).ok();
                let state = Arc::clone(&state);
                let tasks = Arc::clone(&accept_tasks);
                let handle = tokio::spawn(serve_client(stream, state, Arc::clone(&tasks)));
                tasks.lock().unwrap().push(handle);
            }
        });
        tasks.lock().unwrap().push(accept);

        Self { port, tasks }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn read_uvarint(stream: &mut TcpStream) -> io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = stream.read_u8().await?;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

async fn read_hello(stream: &mut TcpStream) -> io::Result<(String, bool)> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    assert_eq!(magic, MAGIC_BYTES, "bad handshake magic");
    let version = stream.read_u8().await?;
    assert_eq!(version, PROTOCOL_VERSION, "bad handshake version");
    let len = read_uvarint(stream).await? as usize;
    let mut name = vec![0u8; len];
    stream.read_exact(&mut name).await?;
    let flag = stream.read_u8().await?;
    stream.write_all(&[0x00]).await?;
    stream.flush().await?;
    Ok((String::from_utf8(name).expect("utf8 app name"), flag == 1))
}

async fn serve_client(
    mut stream: TcpStream,
    state: Arc<Mutex<RelayState>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let Ok((app, accepts_inbound)) = read_hello(&mut stream).await else {
        return;
    };
    let framed = Framed::new(stream, PacketCodec::default());
    let (mut sink, mut packets) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

    let cid = {
        let mut st = state.lock().unwrap();
        st.next_client += 1;
        let cid = st.next_client;
        st.clients.insert(
            cid,
            ClientEntry {
                app: app.clone(),
                accepts_inbound,
                tx,
            },
        );
        st.apps.entry(app).or_default().push(cid);
        cid
    };

    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });
    tasks.lock().unwrap().push(writer);

    while let Some(Ok(packet)) = packets.next().await {
        if matches!(packet, Packet::Close) {
            break;
        }
        route(&state, cid, packet);
    }
    unregister(&state, cid);
}

fn first_inbound_peer(st: &RelayState, app: &str) -> Option<u64> {
    st.apps.get(app)?.iter().copied().find(|cid| {
        st.clients
            .get(cid)
            .is_some_and(|client| client.accepts_inbound)
    })
}

fn send_to(st: &RelayState, cid: u64, packet: Packet) {
    if let Some(client) = st.clients.get(&cid) {
        let _ = client.tx.send(packet);
    }
}

fn route(state: &Arc<Mutex<RelayState>>, from: u64, packet: Packet) {
    let mut st = state.lock().unwrap();
    match packet {
        Packet::Broadcast { app, message } => {
            let targets: Vec<u64> = st
                .apps
                .get(&app)
                .map(|clients| {
                    clients
                        .iter()
                        .copied()
                        .filter(|cid| {
                            st.clients
                                .get(cid)
                                .is_some_and(|client| client.accepts_inbound)
                        })
                        .collect()
                })
                .unwrap_or_default();
            for cid in targets {
                send_to(
                    &st,
                    cid,
                    Packet::Broadcast {
                        app: app.clone(),
                        message: message.clone(),
                    },
                );
            }
        }

        Packet::Request {
            id,
            app,
            request,
            timeout_ms,
        } => match first_inbound_peer(&st, &app) {
            Some(peer) => {
                st.next_request += 1;
                let rid = st.next_request;
                st.requests.insert(rid, (from, id));
                send_to(
                    &st,
                    peer,
                    Packet::Request {
                        id: rid,
                        app,
                        request,
                        timeout_ms,
                    },
                );
            }
            None => {
                send_to(
                    &st,
                    from,
                    Packet::Reply {
                        id,
                        result: Err(format!("no peer registered for app {app}")),
                    },
                );
            }
        },

        Packet::Reply { id, result } => {
            if let Some((origin, origin_id)) = st.requests.remove(&id) {
                send_to(
                    &st,
                    origin,
                    Packet::Reply {
                        id: origin_id,
                        result,
                    },
                );
            }
        }

        Packet::Subscribe { id, topic } => {
            st.topics.entry(topic).or_default().push(from);
            send_to(
                &st,
                from,
                Packet::Reply {
                    id,
                    result: Ok(Vec::new()),
                },
            );
        }

        Packet::Unsubscribe { id, topic } => {
            if let Some(subs) = st.topics.get_mut(&topic) {
                subs.retain(|cid| *cid != from);
            }
            send_to(
                &st,
                from,
                Packet::Reply {
                    id,
                    result: Ok(Vec::new()),
                },
            );
        }

        Packet::Publish { topic, message } => {
            let subs = st.topics.get(&topic).cloned().unwrap_or_default();
            for cid in subs {
                send_to(
                    &st,
                    cid,
                    Packet::Publish {
                        topic: topic.clone(),
                        message: message.clone(),
                    },
                );
            }
        }

        Packet::TunnelInit {
            id,
            app,
            timeout_ms,
        } => {
            // No inbound-capable peer: stay silent and let the opener time out.
            if let Some(peer) = first_inbound_peer(&st, &app) {
                st.next_route += 1;
                let initiator_key = st.next_route;
                st.next_route += 1;
                let acceptor_key = st.next_route;
                st.pending_tunnels.insert(
                    acceptor_key,
                    PendingTunnel {
                        initiator: from,
                        initiator_tunnel: id,
                        initiator_key,
                    },
                );
                send_to(
                    &st,
                    peer,
                    Packet::TunnelInit {
                        id: acceptor_key,
                        app,
                        timeout_ms,
                    },
                );
            }
        }

        Packet::TunnelConfirm { init_id, tun_id } => {
            if let Some(pending) = st.pending_tunnels.remove(&init_id) {
                st.tunnels.insert(
                    pending.initiator_key,
                    RouteEntry {
                        dest_client: from,
                        dest_tunnel: tun_id,
                        partner_key: init_id,
                    },
                );
                st.tunnels.insert(
                    init_id,
                    RouteEntry {
                        dest_client: pending.initiator,
                        dest_tunnel: pending.initiator_tunnel,
                        partner_key: pending.initiator_key,
                    },
                );
                send_to(
                    &st,
                    pending.initiator,
                    Packet::TunnelConfirm {
                        init_id: pending.initiator_tunnel,
                        tun_id: pending.initiator_key,
                    },
                );
            }
        }

        Packet::TunnelTransfer { id, size, payload } => {
            if let Some(entry) = st.tunnels.get(&id) {
                let (dest_client, dest_tunnel) = (entry.dest_client, entry.dest_tunnel);
                send_to(
                    &st,
                    dest_client,
                    Packet::TunnelTransfer {
                        id: dest_tunnel,
                        size,
                        payload,
                    },
                );
            }
        }

        Packet::TunnelAllow { id, bytes } => {
            if let Some(entry) = st.tunnels.get(&id) {
                let (dest_client, dest_tunnel) = (entry.dest_client, entry.dest_tunnel);
                send_to(
                    &st,
                    dest_client,
                    Packet::TunnelAllow {
                        id: dest_tunnel,
                        bytes,
                    },
                );
            }
        }

        Packet::TunnelClose { id } => {
            if let Some(entry) = st.tunnels.remove(&id) {
                st.tunnels.remove(&entry.partner_key);
                send_to(
                    &st,
                    entry.dest_client,
                    Packet::TunnelClose {
                        id: entry.dest_tunnel,
                    },
                );
            }
        }

        Packet::Close => {}
    }
}

fn unregister(state: &Arc<Mutex<RelayState>>, cid: u64) {
    let mut st = state.lock().unwrap();
    if let Some(entry) = st.clients.remove(&cid) {
        if let Some(list) = st.apps.get_mut(&entry.app) {
            list.retain(|c| *c != cid);
            if list.is_empty() {
                st.apps.remove(&entry.app);
            }
        }
    }
    for subs in st.topics.values_mut() {
        subs.retain(|c| *c != cid);
    }
    st.requests.retain(|_, (origin, _)| *origin != cid);
    st.pending_tunnels.retain(|_, p| p.initiator != cid);

    let dead_keys: Vec<u64> = st
        .tunnels
        .iter()
        .filter(|(_, entry)| entry.dest_client == cid)
        .map(|(key, _)| *key)
        .collect();
    for key in dead_keys {
        let Some(entry) = st.tunnels.remove(&key) else {
            continue;
        };
        if let Some(partner) = st.tunnels.remove(&entry.partner_key) {
            send_to(
                &st,
                partner.dest_client,
                Packet::TunnelClose {
                    id: partner.dest_tunnel,
                },
            );
        }
    }
}
