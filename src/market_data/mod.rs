pub mod candle_store;
pub mod feed;
pub mod price_history;

pub use candle_store::{ApplyOutcome, CandleStore};
pub use feed::{HistoricalSource, KlineSubscription, LiveSource, LiveTick, StreamEvent};
pub use price_history::PriceHistory;
