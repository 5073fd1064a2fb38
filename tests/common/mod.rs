//! Shared fixtures for dispatch integration tests
//!
//! A scripted transport whose nodes answer, stall, fail or refuse
//! connections as each test dictates, plus a health pinger with fixed
//! document counts.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use searchdispatch::cluster::{HealthPinger, Node, Pong, TopologySnapshot};
use searchdispatch::search::{
    Coverage, FillReply, FillRequest, GlobalId, LeanHit, SearchReply, SearchRequest,
};
use searchdispatch::transport::{ConnectionPool, NodeConnection, Transport};
use searchdispatch::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a scripted node reacts to a search
#[derive(Clone)]
pub enum Behavior {
    Answer(SearchReply),
    Delay(Duration, SearchReply),
    Fail(String),
}

#[derive(Default)]
pub struct Script {
    behaviors: Mutex<HashMap<u32, Behavior>>,
    refused: Mutex<HashSet<u32>>,
    requests: Mutex<Vec<SearchRequest>>,
    fills: Mutex<Vec<FillRequest>>,
}

impl Script {
    pub fn set(&self, key: u32, behavior: Behavior) {
        self.behaviors.lock().insert(key, behavior);
    }

    pub fn answer(&self, key: u32, reply: SearchReply) {
        self.set(key, Behavior::Answer(reply));
    }

    pub fn delay(&self, key: u32, by: Duration, reply: SearchReply) {
        self.set(key, Behavior::Delay(by, reply));
    }

    pub fn fail(&self, key: u32, reason: &str) {
        self.set(key, Behavior::Fail(reason.to_string()));
    }

    /// Connections to `key` cannot be opened
    pub fn refuse(&self, key: u32) {
        self.refused.lock().insert(key);
    }

    /// Distribution keys searched so far, in request order
    pub fn searched_keys(&self) -> Vec<u32> {
        self.requests.lock().iter().map(|r| r.distribution_key).collect()
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests.lock().clone()
    }

    pub fn fills(&self) -> Vec<FillRequest> {
        self.fills.lock().clone()
    }
}

pub struct ScriptedConnection {
    key: u32,
    script: Arc<Script>,
}

#[async_trait]
impl NodeConnection for ScriptedConnection {
    async fn search(&self, request: SearchRequest) -> Result<SearchReply> {
        let wanted = request.hits as usize;
        self.script.requests.lock().push(request);
        let behavior = self.script.behaviors.lock().get(&self.key).cloned();

        let mut reply = match behavior {
            Some(Behavior::Answer(reply)) => reply,
            Some(Behavior::Delay(by, reply)) => {
                tokio::time::sleep(by).await;
                reply
            }
            Some(Behavior::Fail(reason)) => return Err(Error::Transport(reason)),
            None => SearchReply {
                coverage: Coverage::for_node(0, 0, 0),
                ..Default::default()
            },
        };
        reply.hits.truncate(wanted);
        Ok(reply)
    }

    async fn fill(&self, request: FillRequest) -> Result<FillReply> {
        let summaries = request
            .gids
            .iter()
            .map(|gid| (*gid, Bytes::from(format!("summary from {}", self.key))))
            .collect();
        self.script.fills.lock().push(request);
        Ok(FillReply {
            summaries,
            errors: Vec::new(),
        })
    }
}

pub struct ScriptedPool {
    script: Arc<Script>,
    generation: u64,
    closed: AtomicU32,
}

impl ScriptedPool {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn close_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ConnectionPool for ScriptedPool {
    fn open(&self, node: &Node) -> Result<Arc<dyn NodeConnection>> {
        if self.script.refused.lock().contains(&node.key()) {
            return Err(Error::NodeUnreachable {
                distribution_key: node.key(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(ScriptedConnection {
            key: node.key(),
            script: self.script.clone(),
        }))
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    pub script: Arc<Script>,
    pools: Mutex<Vec<Arc<ScriptedPool>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pools created so far, oldest first
    pub fn pools(&self) -> Vec<Arc<ScriptedPool>> {
        self.pools.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn create_pool(&self, topology: &TopologySnapshot) -> Result<Arc<dyn ConnectionPool>> {
        let pool = Arc::new(ScriptedPool {
            script: self.script.clone(),
            generation: topology.generation(),
            closed: AtomicU32::new(0),
        });
        self.pools.lock().push(pool.clone());
        Ok(pool)
    }
}

/// Every node reports `docs` active documents unless told otherwise.
pub struct StaticPinger {
    docs: u64,
    down: Mutex<HashSet<u32>>,
    blocking: Mutex<HashSet<u32>>,
}

impl StaticPinger {
    pub fn new(docs: u64) -> Arc<Self> {
        Arc::new(Self {
            docs,
            down: Mutex::new(HashSet::new()),
            blocking: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_down(&self, key: u32) {
        self.down.lock().insert(key);
    }

    pub fn set_blocking(&self, key: u32) {
        self.blocking.lock().insert(key);
    }
}

#[async_trait]
impl HealthPinger for StaticPinger {
    async fn ping(&self, node: &Node) -> Result<Pong> {
        if self.down.lock().contains(&node.key()) {
            return Err(Error::NodeUnreachable {
                distribution_key: node.key(),
                reason: "ping refused".to_string(),
            });
        }
        Ok(Pong {
            active_docs: self.docs,
            target_active_docs: self.docs,
            blocking_writes: self.blocking.lock().contains(&node.key()),
        })
    }
}

pub fn gid(name: &str) -> GlobalId {
    GlobalId::from_slice(name.as_bytes())
}

pub fn hit(name: &str, relevance: f64, key: u32) -> LeanHit {
    LeanHit::with_relevance(gid(name), relevance, 0, key)
}

/// A reply holding `hits`, best first, with every document searched.
pub fn reply(hits: Vec<LeanHit>, docs: u64) -> SearchReply {
    SearchReply {
        total_hits: hits.len() as u64,
        hits,
        coverage: Coverage::for_node(docs, docs, docs),
        ..Default::default()
    }
}

pub fn gids(hits: &[LeanHit]) -> Vec<GlobalId> {
    hits.iter().map(|h| h.gid).collect()
}
