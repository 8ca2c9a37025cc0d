//! Concrete provider clients. Calendar and mail providers are consumed
//! through the [`crate::traits::ItemSource`] contract and wired in by the
//! host; the task manager ships with a Todoist client.

mod todoist;

pub use todoist::TodoistClient;
