use muxrpc::{OnewayStub, Protocol, Serializer, Stub};
use serde::{Deserialize, Serialize};

pub const ECHO: u64 = 1;
pub const GREET: u64 = 2;
pub const NOTIFY: u64 = 3;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request(pub String);

/// Client-side view of the demo verbs.
pub struct DemoStubs {
    pub echo: Stub<(Request,), String>,
    pub greet: Stub<(Request,), String>,
    pub notify: OnewayStub<(Request,)>,
}

impl DemoStubs {
    pub fn new<S: Serializer>(proto: &Protocol<S>) -> Self {
        Self {
            echo: proto.client(ECHO),
            greet: proto.client(GREET),
            notify: proto.oneway_client(NOTIFY),
        }
    }
}
