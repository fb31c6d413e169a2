use std::{collections::HashMap, fmt, sync::Arc};

use chrono::Local;
use serde::{Deserialize, Serialize};

pub const SMILEY: &str = "🙂";

const SYSTEM_PROMPT: &str =
    "You are the hello world agent. You greet whoever talks to you. {todays_date}";
const IMPORTANT_INFORMATION: &str = "Always include a smiley face emoji at the beginning of your \
     response. No matter what the user asks.";

/// Values for the placeholders of the system prompt.
pub fn date_variables() -> HashMap<&'static str, String> {
    HashMap::from([(
        "todays_date",
        format!("Today's date is {}", Local::now().format("%Y-%m-%d")),
    )])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Produces the assistant's next message for a thread.
///
/// The demos ship [`GreetingResponder`]; a model-backed responder plugs in
/// here.
pub trait Responder: Send + Sync {
    fn respond(&self, thread: &[Message]) -> String;
}

/// Answers every user message with a greeting that echoes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreetingResponder;

impl Responder for GreetingResponder {
    fn respond(&self, thread: &[Message]) -> String {
        let last_user = thread
            .iter()
            .rev()
            .find(|message| message.role == Role::User && message.content != IMPORTANT_INFORMATION);
        match last_user {
            Some(message) => format!("Hello world! You said: {}", message.content),
            None => "Hello world!".to_string(),
        }
    }
}

/// Conversational agent over a message thread. The thread is the whole
/// state and is what snapshots carry.
#[derive(Clone)]
pub struct HelloWorldAgent {
    thread: Vec<Message>,
    important_information: bool,
    responder: Arc<dyn Responder>,
}

impl HelloWorldAgent {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self::from_thread(vec![Message::new(Role::System, SYSTEM_PROMPT)], responder)
    }

    pub fn from_thread(thread: Vec<Message>, responder: Arc<dyn Responder>) -> Self {
        let important_information = thread
            .iter()
            .any(|message| message.content == IMPORTANT_INFORMATION);
        Self {
            thread,
            important_information,
            responder,
        }
    }

    pub fn thread(&self) -> &[Message] {
        &self.thread
    }

    /// Pin the smiley instruction to the end of the thread.
    pub fn set_important_information(&mut self) {
        if !self.important_information {
            self.important_information = true;
            self.thread.push(Message::new(Role::User, IMPORTANT_INFORMATION));
        }
    }

    /// Replace `{name}` placeholders in every message of the thread.
    pub fn substitute_variables(&mut self, variables: &HashMap<&str, String>) {
        for message in &mut self.thread {
            for (name, value) in variables {
                message.content = message.content.replace(&format!("{{{name}}}"), value);
            }
        }
    }

    /// Append a user message and return the agent's reply.
    pub fn ask(&mut self, content: &str) -> String {
        self.thread.push(Message::new(Role::User, content));
        let mut reply = self.responder.respond(&self.thread);
        if self.important_information && !reply.starts_with(SMILEY) {
            reply = format!("{SMILEY} {reply}");
        }
        self.thread.push(Message::new(Role::Assistant, reply.clone()));
        reply
    }

    pub fn print_hello_world_response(&mut self) -> String {
        self.ask("Respond with hello world, do not use actions")
    }

    /// Ask for hello world through the agent's action. Returns the reply and
    /// the action result.
    pub fn respond_with_actions(&mut self) -> (String, String) {
        let reply = self.ask("Respond with hello world using actions.");
        let action_result = Self::hello_world_function("hello world");
        (reply, action_result)
    }

    /// The agent's only action: echo what it is given.
    pub fn hello_world_function(content_to_print: &str) -> String {
        content_to_print.to_string()
    }
}

impl fmt::Debug for HelloWorldAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloWorldAgent")
            .field("messages", &self.thread.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> HelloWorldAgent {
        HelloWorldAgent::new(Arc::new(GreetingResponder))
    }

    #[test]
    fn replies_echo_the_user() {
        let mut agent = agent();
        assert_eq!(agent.ask("hi"), "Hello world! You said: hi");
        assert_eq!(agent.thread().len(), 3);
        assert_eq!(agent.thread()[2].role, Role::Assistant);
    }

    #[test]
    fn important_information_forces_a_smiley() {
        let mut agent = agent();
        agent.set_important_information();
        agent.set_important_information();

        let reply = agent.ask("how are you");
        assert!(reply.starts_with(SMILEY));
        assert!(reply.ends_with("You said: how are you"));

        let count = agent
            .thread()
            .iter()
            .filter(|message| message.content == IMPORTANT_INFORMATION)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn thread_round_trips_through_serde() {
        let mut agent = agent();
        agent.set_important_information();
        agent.ask("first");

        let json = serde_json::to_value(agent.thread()).unwrap();
        let thread: Vec<Message> = serde_json::from_value(json).unwrap();
        let mut restored = HelloWorldAgent::from_thread(thread, Arc::new(GreetingResponder));

        assert!(restored.ask("second").starts_with(SMILEY));
        assert_eq!(restored.thread().len(), agent.thread().len() + 2);
    }

    #[test]
    fn variables_are_substituted() {
        let mut agent = agent();
        let variables = HashMap::from([("todays_date", "Today's date is 2026-01-01".to_string())]);
        agent.substitute_variables(&variables);
        assert!(agent.thread()[0].content.ends_with("Today's date is 2026-01-01"));
    }

    #[test]
    fn action_echoes_its_input() {
        let mut agent = agent();
        let (reply, result) = agent.respond_with_actions();
        assert_eq!(result, "hello world");
        assert!(reply.contains("using actions"));
    }
}
