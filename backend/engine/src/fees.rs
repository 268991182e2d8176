//! # Fee calculator
//!
//! Computes the gross / platform-fee / tip / net / total-charge split of a
//! donation. All amounts are integer minor units and all rates are basis
//! points, so the result is exact and identical on every call with the same
//! inputs.
//!
//! ## Policies
//!
//! | `cover_fees` | charity receives           | donor is charged                               |
//! |--------------|----------------------------|------------------------------------------------|
//! | `true`       | the full gross amount      | `(gross + platform + tip) / (1 - gateway)`     |
//! | `false`      | `gross - platform - gateway` | `gross + tip`                                |
//!
//! Every division rounds half-up to the nearest minor unit.

use serde::{Deserialize, Serialize};

/// Gateway processing fee, 2.5%.
pub const GATEWAY_FEE_BPS: u32 = 250;

/// Default platform fee, 5%.
pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 500;

const BPS_SCALE: i128 = 10_000;

/// Persisted snapshot of a donation's fee split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub tip_amount: i64,
    pub net_amount: i64,
    pub total_charge: i64,
    pub gateway_fee: i64,
    pub donor_covers_fees: bool,
}

/// Rates in effect for a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRates {
    pub platform_fee_bps: u32,
    pub gateway_fee_bps: u32,
}

impl Default for FeeRates {
    fn default() -> Self {
        Self {
            platform_fee_bps: DEFAULT_PLATFORM_FEE_BPS,
            gateway_fee_bps: GATEWAY_FEE_BPS,
        }
    }
}

impl FeeRates {
    pub fn with_platform_fee(platform_fee_bps: u32) -> Self {
        Self {
            platform_fee_bps,
            ..Self::default()
        }
    }
}

/// Compute the fee split for a donation.
///
/// `gross_amount` is expected positive and `tip_amount` non-negative; range
/// checks (minimum donation, net floor, gateway ceiling) belong to the caller.
pub fn calculate(gross_amount: i64, tip_amount: i64, cover_fees: bool, rates: FeeRates) -> FeeBreakdown {
    let gross = i128::from(gross_amount);
    let tip = i128::from(tip_amount.max(0));
    let platform_fee = div_round_half_up(gross * i128::from(rates.platform_fee_bps), BPS_SCALE);

    let (net, total_charge, gateway_fee) = if cover_fees {
        // The tip is kept by the platform; the charity is made whole.
        let amount_to_receive = gross + platform_fee + tip;
        let total_charge = div_round_half_up(
            amount_to_receive * BPS_SCALE,
            BPS_SCALE - i128::from(rates.gateway_fee_bps),
        );
        (gross, total_charge, total_charge - amount_to_receive)
    } else {
        let gateway_fee = div_round_half_up(gross * i128::from(rates.gateway_fee_bps), BPS_SCALE);
        (gross - platform_fee - gateway_fee, gross + tip, gateway_fee)
    };

    FeeBreakdown {
        gross_amount,
        platform_fee: narrow(platform_fee),
        tip_amount: narrow(tip),
        net_amount: narrow(net),
        total_charge: narrow(total_charge),
        gateway_fee: narrow(gateway_fee),
        donor_covers_fees: cover_fees,
    }
}

/// Round-half-up division; `den` must be positive.
fn div_round_half_up(num: i128, den: i128) -> i128 {
    if num >= 0 {
        (2 * num + den) / (2 * den)
    } else {
        -((-2 * num + den) / (2 * den))
    }
}

fn narrow(v: i128) -> i64 {
    i64::try_from(v).unwrap_or(if v < 0 { i64::MIN } else { i64::MAX })
}
