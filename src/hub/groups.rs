//! Recipient group naming.

use super::identity::UserRsn;

pub const USER_GROUP_PREFIX: &str = "User-";
pub const USER_RSN_GROUP_PREFIX: &str = "UserRsn-";

/// Strip the separators the credential encoding carries but group keys may not.
///
/// `"ab.cd.ef"` becomes `"abcdef"`. Applying it twice is a no-op.
pub fn normalize_token(raw: &str) -> String {
    raw.replace('.', "")
}

/// Group holding every connection that presented `user_token`
pub fn user_group(user_token: &str) -> String {
    format!("{}{}", USER_GROUP_PREFIX, user_token)
}

/// Group holding every connection resolved to `user_rsn`
pub fn user_rsn_group(user_rsn: &UserRsn) -> String {
    format!("{}{}", USER_RSN_GROUP_PREFIX, user_rsn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_normalize_token_strips_periods() {
        assert_eq!(normalize_token("ab.cd.ef"), "abcdef");
        assert_eq!(normalize_token("abcdef"), "abcdef");
        assert_eq!(normalize_token("..."), "");
    }

    #[test]
    fn test_normalize_token_is_idempotent() {
        let once = normalize_token("eyJ.hbGc.iOi");
        assert_eq!(normalize_token(&once), once);
    }

    #[test]
    fn test_group_names() {
        assert_eq!(user_group(&normalize_token("ab.cd.ef")), "User-abcdef");

        let rsn = UserRsn::from(Uuid::nil());
        assert_eq!(
            user_rsn_group(&rsn),
            "UserRsn-00000000-0000-0000-0000-000000000000"
        );
    }
}
