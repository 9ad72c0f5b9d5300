use crate::types::{CampaignCounters, CampaignRates};

/// Derives funnel rates from campaign counters.
///
/// Opens and replies are measured against delivered mail, clicks against
/// opens. A zero denominator yields `0.0`.
pub fn compute_rates(counters: &CampaignCounters) -> CampaignRates {
    CampaignRates {
        delivery_rate: ratio(counters.total_delivered, counters.total_sent),
        open_rate: ratio(counters.total_opened, counters.total_delivered),
        click_rate: ratio(counters.total_clicked, counters.total_opened),
        reply_rate: ratio(counters.total_replied, counters.total_delivered),
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(sent: u64, delivered: u64, opened: u64, clicked: u64, replied: u64) -> CampaignCounters {
        CampaignCounters {
            total_sent: sent,
            total_delivered: delivered,
            total_opened: opened,
            total_clicked: clicked,
            total_replied: replied,
            ..CampaignCounters::default()
        }
    }

    #[test]
    fn all_zero_counters_yield_zero_rates() {
        let rates = compute_rates(&CampaignCounters::default());
        assert_eq!(rates, CampaignRates::default());
        for value in [rates.delivery_rate, rates.open_rate, rates.click_rate, rates.reply_rate] {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn rates_use_the_documented_denominators() {
        let cases = [
            (counters(100, 80, 40, 10, 8), (0.8, 0.5, 0.25, 0.1)),
            (counters(10, 10, 0, 0, 0), (1.0, 0.0, 0.0, 0.0)),
            // events can arrive before the send is recorded
            (counters(0, 3, 3, 3, 1), (0.0, 1.0, 1.0, 1.0 / 3.0)),
            (counters(5, 0, 2, 1, 1), (0.0, 0.0, 0.5, 0.0)),
        ];

        for (input, (delivery, open, click, reply)) in cases {
            let rates = compute_rates(&input);
            assert_eq!(rates.delivery_rate, delivery, "{input:?}");
            assert_eq!(rates.open_rate, open, "{input:?}");
            assert_eq!(rates.click_rate, click, "{input:?}");
            assert_eq!(rates.reply_rate, reply, "{input:?}");
        }
    }
}
