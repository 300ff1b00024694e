mod http;

pub use http::{
    send_to_all, send_to_all_except_token, send_to_identities, send_to_token, DispatchAccepted,
    EventContent, SendToAllExceptTokenRequest, SendToAllRequest, SendToIdentitiesRequest,
    SendToTokenRequest,
};
