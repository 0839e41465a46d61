use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use as4_relay::collaborators::{CollaboratorResult, SendResult, Sender, SenderRegistry};
use as4_relay::models::Envelope;
use as4_relay::pmode::Method;

/// A scripted transport registered under its own method type
///
/// Each send pops the next scripted result (success once the script runs
/// dry) and records the envelope.
#[derive(Clone)]
pub struct Transport {
    method_type: &'static str,
    script: Arc<Mutex<VecDeque<SendResult>>>,
    sent: Arc<Mutex<Vec<Envelope>>>,
}

impl Transport {
    pub fn new(method_type: &'static str) -> Self {
        Self {
            method_type,
            script: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn method(&self) -> Method {
        Method::new(self.method_type)
    }

    pub fn register(&self, registry: &mut SenderRegistry) {
        let transport = self.clone();
        registry.register(self.method_type, move || {
            Box::new(ScriptedSender {
                transport: transport.clone(),
            }) as Box<dyn Sender>
        });
    }

    pub fn push(&self, result: SendResult) {
        self.script.lock().push_back(result);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

struct ScriptedSender {
    transport: Transport,
}

#[async_trait]
impl Sender for ScriptedSender {
    fn configure(&mut self, _parameters: &HashMap<String, String>) -> CollaboratorResult<()> {
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> SendResult {
        self.transport.sent.lock().push(envelope.clone());
        self.transport
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(SendResult::success)
    }
}
