use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use vakit_proto::protocol::{Broadcast, Message, PROTOCOL_VERSION};
use vakit_proto::state::StateManager;

pub struct ClientHandle {
    pub id: usize,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    clients: Arc<RwLock<Vec<ClientHandle>>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;

                    let client_count = {
                        let mut guard = clients.write().await;
                        guard.push(ClientHandle { id });
                        guard.len()
                    };
                    info!("Client {} connected from {} ({} total)", id, peer, client_count);

                    let sm = state_manager.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    let clients_ref = clients.clone();

                    tokio::spawn(async move {
                        handle_client(stream, sm, id, evt_tx, bcast_rx).await;

                        let client_count = {
                            let mut guard = clients_ref.write().await;
                            guard.retain(|c| c.id != id);
                            guard.len()
                        };
                        info!("Client {} disconnected ({} left)", id, client_count);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Hello carries the full snapshot so the panel can draw immediately
    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::StatusUpdated) => None,
                    Ok(BroadcastMessage::Reminder { prayer, minutes_left }) => {
                        Some(Broadcast::Reminder { prayer, minutes_left })
                    }
                    Ok(BroadcastMessage::Blink(on)) => Some(Broadcast::Blink { on }),
                    Ok(BroadcastMessage::Log(message)) => Some(Broadcast::Log { message }),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        None
                    }
                    Err(_) => break,
                };
                let encoded = match broadcast {
                    Some(b) => Message::Broadcast(b).encode(),
                    None => encode_status(&state_manager).await,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let status = state_manager.get_status().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        status,
    })
    .encode()
}

async fn encode_status(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let status = state_manager.get_status().await;
    Message::Broadcast(Broadcast::Status { data: status }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vakit_proto::protocol::Command;

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().0
    }

    #[tokio::test]
    async fn test_hello_then_commands_and_broadcasts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state_manager = Arc::new(StateManager::new(Vec::new(), Vec::new()));
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let (broadcast_tx, _) = broadcast::channel(16);

        let sm = state_manager.clone();
        let btx = broadcast_tx.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream, sm, 1, event_tx, btx.subscribe()).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version, ..
            }) => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("expected hello, got {:?}", other),
        }

        let cmd = Message::Command(Command::SetSound { enabled: false });
        client.write_all(&cmd.encode().unwrap()).await.unwrap();
        match event_rx.recv().await {
            Some(DaemonEvent::ClientCommand(Command::SetSound { enabled })) => assert!(!enabled),
            other => panic!("unexpected {:?}", other),
        }

        broadcast_tx.send(BroadcastMessage::Blink(true)).unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Blink { on }) => assert!(on),
            other => panic!("expected blink, got {:?}", other),
        }
    }
}
