//! QuickBooks connect flow support

pub mod state_store;

pub use state_store::{
    generate_state, AuthStateStore, MemoryAuthStateStore, RedisAuthStateStore, StateStoreError,
};
