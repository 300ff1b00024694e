mod settings;

pub use settings::{
    ApiConfig, IdentityConfig, RelayConfig, ServerConfig, Settings, WebSocketConfig,
};
