//! Static pricing catalog: subscription plans and one-time credit packages.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlanDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    /// Credits granted for every paid billing period.
    pub credits: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PackageDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub credits: i64,
    pub price_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    #[default]
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "monthly" => Some(BillingPeriod::Monthly),
            "yearly" => Some(BillingPeriod::Yearly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
        }
    }

    /// Stripe `recurring.interval` value.
    pub fn interval(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "month",
            BillingPeriod::Yearly => "year",
        }
    }
}

impl PlanDefinition {
    pub fn price_cents(&self, period: BillingPeriod) -> i64 {
        match period {
            BillingPeriod::Monthly => self.monthly_price_cents,
            BillingPeriod::Yearly => self.yearly_price_cents,
        }
    }
}

pub const PLANS: [PlanDefinition; 3] = [
    PlanDefinition {
        id: "starter",
        name: "Starter",
        monthly_price_cents: 900,
        yearly_price_cents: 9_000,
        credits: 200,
    },
    PlanDefinition {
        id: "pro",
        name: "Pro",
        monthly_price_cents: 2_900,
        yearly_price_cents: 29_000,
        credits: 1_000,
    },
    PlanDefinition {
        id: "business",
        name: "Business",
        monthly_price_cents: 9_900,
        yearly_price_cents: 99_000,
        credits: 5_000,
    },
];

pub const PACKAGES: [PackageDefinition; 3] = [
    PackageDefinition {
        id: "credits_100",
        name: "100 credits",
        credits: 100,
        price_cents: 1_200,
    },
    PackageDefinition {
        id: "credits_500",
        name: "500 credits",
        credits: 500,
        price_cents: 4_900,
    },
    PackageDefinition {
        id: "credits_1500",
        name: "1500 credits",
        credits: 1_500,
        price_cents: 12_900,
    },
];

pub fn find_plan(id: &str) -> Option<&'static PlanDefinition> {
    PLANS.iter().find(|plan| plan.id == id)
}

pub fn find_package(id: &str) -> Option<&'static PackageDefinition> {
    PACKAGES.iter().find(|package| package.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_exact() {
        assert_eq!(find_plan("pro").map(|p| p.credits), Some(1_000));
        assert!(find_plan("PRO").is_none());
        assert_eq!(find_package("credits_500").map(|p| p.price_cents), Some(4_900));
        assert!(find_package("credits_9000").is_none());
    }

    #[test]
    fn billing_period_parsing() {
        assert_eq!(BillingPeriod::parse(" Yearly "), Some(BillingPeriod::Yearly));
        assert_eq!(BillingPeriod::parse("weekly"), None);
        let plan = find_plan("starter").expect("starter");
        assert_eq!(plan.price_cents(BillingPeriod::Yearly), 9_000);
        assert_eq!(BillingPeriod::Monthly.interval(), "month");
    }
}
