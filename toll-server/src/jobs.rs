mod refresh_balances;

pub use refresh_balances::{refresh_all, RefreshBalances, RefreshSummary};
