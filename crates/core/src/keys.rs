//! Key schema for the durable state and config stores.

use crate::types::FunnelStep;

pub const STATE_PREFIX: &str = "txn_";

/// `txn_<transactionId>` -> JSON `TransactionState`.
pub fn state_key(transaction_id: &str) -> String {
    format!("{STATE_PREFIX}{transaction_id}")
}

/// `txn_<transactionId>_claim_<step>` -> atomic per-step dispatch claim.
pub fn claim_key(transaction_id: &str, step: FunnelStep) -> String {
    format!("{STATE_PREFIX}{transaction_id}_claim_{step}")
}

/// `<siteId>_<step>_affid_<affiliateId>_<Scrub|Normal>Actions`. The caller
/// passes the affiliate id already normalized to lower case.
pub fn action_list_key(site_id: &str, step: FunnelStep, affiliate_id: &str, is_scrub: bool) -> String {
    let variant = if is_scrub { "Scrub" } else { "Normal" };
    format!("{site_id}_{step}_affid_{affiliate_id}_{variant}Actions")
}

/// `<siteId>_<actionKey>` -> JSON `ActionDefinition`.
pub fn action_definition_key(site_id: &str, action_key: &str) -> String {
    format!("{site_id}_{action_key}")
}

pub fn global_scrub_key(site_id: &str) -> String {
    format!("{site_id}_global_scrub_percent")
}

pub fn network_scrub_key(site_id: &str, network_id: &str) -> String {
    format!("{site_id}_network_scrub:{network_id}")
}

pub fn affiliate_scrub_key(site_id: &str, affiliate_id: &str) -> String {
    format!("{site_id}_affiliate_scrub:{affiliate_id}")
}

pub fn normal_campaign_key(site_id: &str) -> String {
    format!("{site_id}_normal_campaign_id")
}

pub fn scrub_campaign_key(site_id: &str) -> String {
    format!("{site_id}_scrub_campaign_id")
}

/// Prefix shared by every config entry of one site.
pub fn site_prefix(site_id: &str) -> String {
    format!("{site_id}_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(state_key("abc"), "txn_abc");
        assert_eq!(claim_key("abc", FunnelStep::Upsell(1)), "txn_abc_claim_upsell1");
        assert_eq!(
            action_list_key("s1", FunnelStep::Initial, "aff9", true),
            "s1_initial_affid_aff9_ScrubActions"
        );
        assert_eq!(
            action_list_key("s1", FunnelStep::Upsell(2), "aff9", false),
            "s1_upsell2_affid_aff9_NormalActions"
        );
        assert_eq!(action_definition_key("s1", "fb_purchase"), "s1_fb_purchase");
        assert_eq!(network_scrub_key("s1", "n3"), "s1_network_scrub:n3");
        assert_eq!(affiliate_scrub_key("s1", "a3"), "s1_affiliate_scrub:a3");
        assert_eq!(global_scrub_key("s1"), "s1_global_scrub_percent");
    }
}
