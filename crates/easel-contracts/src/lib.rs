pub mod chat;
pub mod events;
pub mod history;
pub mod ledger;
pub mod models;
pub mod presets;
pub mod session;
pub mod tasks;
pub mod wizard;
