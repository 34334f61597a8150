//! ID generation
//!
//! nanoid based identifiers. Client order ids follow the exchange rule
//! `^[.A-Z:/a-z0-9_-]{1,36}$`.

use nanoid::nanoid;
use crate::timing::millis;

/// Exchange limit on `newClientOrderId`
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 36;

const CLIENT_ORDER_ID_PREFIX: &str = "FL";

/// `<prefix>-<unix millis>-<8 char nanoid>`
fn generate_id_with_prefix(prefix: &str) -> String {
    let short_id = nanoid!(8);
    format!("{prefix}-{}-{short_id}", millis())
}

/// Id for the `newClientOrderId` order field
pub fn generate_client_order_id() -> String {
    let mut id = generate_id_with_prefix(CLIENT_ORDER_ID_PREFIX);
    id.truncate(MAX_CLIENT_ORDER_ID_LEN);
    id
}

/// Whether `id` is accepted by the exchange as a client order id
pub fn is_valid_client_order_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CLIENT_ORDER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '_' | '-'))
}
