// Hardware stream ownership: one live stream per direction, confirmed closes,
// retrying opens and device switches.

pub mod lifecycle;
pub mod safe_config;

pub use lifecycle::{StreamLifecycleConfig, StreamLifecycleManager, StreamMetrics, StreamOpened, StreamSwitched};
pub use safe_config::SafeConfigCache;
