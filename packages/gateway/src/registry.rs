// ABOUTME: Local table of live connections, their rooms and their users
// ABOUTME: Delivery goes through bounded per-connection outboxes so a slow client only loses its own events

use crate::auth::Identity;
use crate::error::{GatewayError, Result};
use runhub_core::{Event, Topic};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub type ConnectionId = u64;

/// A newly registered connection and the receiving end of its outbox
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub events: broadcast::Receiver<Event>,
}

struct Connection {
    identity: Option<Identity>,
    topics: HashSet<Topic>,
    outbox: broadcast::Sender<Event>,
}

#[derive(Default)]
struct RegistryState {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Topic, HashSet<ConnectionId>>,
    users: HashMap<String, HashSet<ConnectionId>>,
}

/// Connection to topic, topic to connection and user to connection relations.
///
/// All three are updated under one lock so they never disagree. Outboxes are
/// `broadcast` channels of `backlog` slots: once full, the oldest event is
/// overwritten and the connection's receiver reports how many it missed.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    backlog: usize,
}

impl ConnectionRegistry {
    pub fn new(backlog: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            backlog: backlog.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Connection registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn register(&self, identity: Option<Identity>) -> Registration {
        let (outbox, events) = broadcast::channel(self.backlog);
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;

        if let Some(identity) = &identity {
            state
                .users
                .entry(identity.user_id.clone())
                .or_default()
                .insert(id);
        }
        state.connections.insert(
            id,
            Connection {
                identity,
                topics: HashSet::new(),
                outbox,
            },
        );

        debug!(connection_id = id, "Registered connection");
        Registration { id, events }
    }

    pub fn identity(&self, id: ConnectionId) -> Option<Identity> {
        self.lock()
            .connections
            .get(&id)
            .and_then(|c| c.identity.clone())
    }

    /// Add a connection to a room. Returns true when it is the room's first member.
    pub fn join(&self, id: ConnectionId, topic: &Topic) -> Result<bool> {
        let mut state = self.lock();
        let connection = state
            .connections
            .get_mut(&id)
            .ok_or(GatewayError::UnknownConnection(id))?;
        connection.topics.insert(topic.clone());

        let room = state.rooms.entry(topic.clone()).or_default();
        let first = room.is_empty();
        room.insert(id);
        Ok(first)
    }

    /// Remove a connection from a room. Returns true when the room is now empty.
    pub fn leave(&self, id: ConnectionId, topic: &Topic) -> bool {
        let mut state = self.lock();
        if let Some(connection) = state.connections.get_mut(&id) {
            connection.topics.remove(topic);
        }
        remove_member(&mut state.rooms, topic, id)
    }

    /// Drop a connection everywhere. Returns the rooms it left empty.
    pub fn on_disconnect(&self, id: ConnectionId) -> Vec<Topic> {
        let mut state = self.lock();
        let Some(connection) = state.connections.remove(&id) else {
            return Vec::new();
        };

        if let Some(identity) = &connection.identity {
            if let Some(user) = state.users.get_mut(&identity.user_id) {
                user.remove(&id);
                if user.is_empty() {
                    state.users.remove(&identity.user_id);
                }
            }
        }

        let emptied = connection
            .topics
            .iter()
            .filter(|topic| remove_member(&mut state.rooms, topic, id))
            .cloned()
            .collect();

        debug!(connection_id = id, "Removed connection");
        emptied
    }

    /// Queue an event for every connection in the topic's room. Never blocks.
    pub fn deliver(&self, event: &Event) -> usize {
        let state = self.lock();
        let Some(room) = state.rooms.get(&event.topic) else {
            return 0;
        };
        room.iter()
            .filter_map(|id| state.connections.get(id))
            .filter(|connection| connection.outbox.send(event.clone()).is_ok())
            .count()
    }

    /// Queue an event for every connection of an authenticated user
    pub fn emit_to_user(&self, user_id: &str, event: &Event) -> usize {
        let state = self.lock();
        let Some(ids) = state.users.get(user_id) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| state.connections.get(id))
            .filter(|connection| connection.outbox.send(event.clone()).is_ok())
            .count()
    }

    pub fn members(&self, topic: &Topic) -> Vec<ConnectionId> {
        let mut members: Vec<_> = self
            .lock()
            .rooms
            .get(topic)
            .map(|room| room.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub fn topics_of(&self, id: ConnectionId) -> Vec<Topic> {
        let mut topics: Vec<_> = self
            .lock()
            .connections
            .get(&id)
            .map(|c| c.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }
}

fn remove_member(
    rooms: &mut HashMap<Topic, HashSet<ConnectionId>>,
    topic: &Topic,
    id: ConnectionId,
) -> bool {
    let Some(room) = rooms.get_mut(topic) else {
        return false;
    };
    if !room.remove(&id) {
        return false;
    }
    if room.is_empty() {
        rooms.remove(topic);
        return true;
    }
    false
}
