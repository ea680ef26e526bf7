use crate::models::{CustomCapConfig, CustomCooldownMode};

/// Resolved cap for a (tier, model) lookup.
#[derive(Debug, Clone)]
pub struct ResolvedCap {
    pub cap: u64,
    pub cooldown: CustomCooldownMode,
}

/// Resolve the effective custom cap for a credential tier and model.
///
/// Resolution priority: tier+model > tier+group > default+model >
/// default+group > none. The caller clamps the cap against the real maximum
/// when the provider reports one.
pub fn resolve_cap(
    caps: &[CustomCapConfig],
    provider: &str,
    tier: u8,
    model: &str,
    group: Option<&str>,
) -> Option<ResolvedCap> {
    let matching = |want_tier: Option<u8>, target: &str| -> Option<ResolvedCap> {
        caps.iter()
            .filter(|c| c.provider == provider)
            .find(|c| c.tier == want_tier && c.target == target)
            .map(|c| ResolvedCap {
                cap: c.cap,
                cooldown: c.cooldown.clone(),
            })
    };

    matching(Some(tier), model)
        .or_else(|| group.and_then(|g| matching(Some(tier), g)))
        .or_else(|| matching(None, model))
        .or_else(|| group.and_then(|g| matching(None, g)))
}

/// Compute the cooldown expiry for a breached cap. Clamped to never end
/// before the natural window reset.
pub fn cap_cooldown_until(
    mode: &CustomCooldownMode,
    window_start_ts: i64,
    natural_reset_ts: i64,
) -> i64 {
    let raw = match mode {
        CustomCooldownMode::QuotaReset => natural_reset_ts,
        CustomCooldownMode::Offset(delta) => natural_reset_ts + delta,
        CustomCooldownMode::Fixed(delta) => window_start_ts + delta,
    };
    raw.max(natural_reset_ts)
}
