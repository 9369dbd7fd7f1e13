mod currency;
mod invoice;
mod ledger;
mod money;
mod saga;
mod transaction;

pub use currency::*;
pub use invoice::*;
pub use ledger::*;
pub use money::*;
pub use saga::*;
pub use transaction::*;
