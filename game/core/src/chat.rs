//! Chat delivery: fan a message out to recipients and append the transcript
//! record to the data provider.

use anvil::client::Client;
use anvil::protocol::packet::{FieldValue, Packet};
use anvil::protocol::registry::ids;
use anvil::protocol::{Direction, ProtocolState};
use ember::logging::{self, Logger};
use ember::store::{ChatRecord, DataProvider};
use std::sync::Arc;

pub struct ChatRouter {
    data: Arc<dyn DataProvider>,
    log: Logger,
}

impl ChatRouter {
    pub fn new(data: Arc<dyn DataProvider>, log: Logger) -> ChatRouter {
        ChatRouter { data, log }
    }

    fn chat_packet(text: &str) -> Packet {
        Packet::new(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            ids::play::CHAT,
            vec![FieldValue::Str(text.to_owned())],
        )
    }

    /// Delivers a player message to every recipient and logs it.
    pub fn broadcast(&self, recipients: &[Arc<Client>], from: &str, message: &str) {
        let packet = Self::chat_packet(&format!("<{}> {}", from, message));
        for client in recipients {
            drop(client.send(&packet));
        }

        logging::info!(self.log, "chat"; "from" => from, "message" => message);
        self.data.write_chat(&ChatRecord::broadcast(from, message));
    }

    /// Delivers a message to a single recipient and logs it.
    pub fn whisper(&self, from: &str, to: &Arc<Client>, message: &str) {
        let packet = Self::chat_packet(&format!("{} whispers: {}", from, message));
        drop(to.send(&packet));

        self.data
            .write_chat(&ChatRecord::whisper(from, &to.username(), message));
    }

    /// Server-originated notice; recorded with the server as sender.
    pub fn system(&self, recipients: &[Arc<Client>], message: &str) {
        let packet = Self::chat_packet(message);
        for client in recipients {
            drop(client.send(&packet));
        }

        logging::info!(self.log, "system chat"; "message" => message);
        self.data.write_chat(&ChatRecord::broadcast("server", message));
    }
}
