//! Session state for a wallet-connected shell: the connection controller,
//! display-name resolution and the chain gate.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod controller;
mod error;
mod gate;
mod names;

pub use controller::{
    ConnectionController, ConnectionState, EagerOutcome, EagerSkip, ProviderEvent, SettleObserver,
};
pub use error::{ConnectionError, classify};
pub use gate::{CHAIN_QUERY_PARAMETER, RequiredChain, chain_gate};
pub use names::{DisplayName, NameLookupFailure, NameResolver, Resolution, Ticket};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
