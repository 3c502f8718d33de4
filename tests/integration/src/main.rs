mod helpers;

mod acks;
mod metadata;
mod state_updates;
mod topology;
