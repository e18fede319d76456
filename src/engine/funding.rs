//! Perpetual funding at interval boundaries.

use super::core::Engine;
use super::results::ExchangeError;
use crate::events::{EventPayload, FundingUpdateEvent};
use crate::funding::{advance_funding, all_perpetual_infos, get_funding, next_boundary, set_funding, set_perpetual_info};
use crate::market::{get_any_derivative_market, MarketInfo};
use tracing::{debug, warn};

impl Engine {
    /// Advances cumulative funding for every perpetual whose boundary has passed.
    /// Positions pick the change up lazily the next time they are touched. A paused market,
    /// or one without a mark price, skips the interval.
    pub(super) fn process_funding(&mut self) -> Result<usize, ExchangeError> {
        let now = self.block.unix_secs();
        let mut updated = 0;
        for mut info in all_perpetual_infos(&self.ledger)? {
            if !info.is_due(now) {
                continue;
            }
            let market = get_any_derivative_market(&self.ledger, &info.market_id)?.filter(|m| m.is_active());
            let mark = market.as_ref().and_then(|m| self.mark_price(m));
            let Some(mark) = mark else {
                if market.is_some() {
                    warn!(market = %info.market_id, "no mark price, funding interval skipped");
                }
                info.next_funding_timestamp = next_boundary(now, info.funding_interval);
                set_perpetual_info(&mut self.ledger, &info)?;
                continue;
            };

            let mid = self.mid_price(&info.market_id)?;
            let mut state = get_funding(&self.ledger, &info.market_id)?;
            let rate = advance_funding(&mut info, &mut state, mid, mark, now);
            set_funding(&mut self.ledger, &info.market_id, &state)?;
            set_perpetual_info(&mut self.ledger, &info)?;
            debug!(market = %info.market_id, %rate, cumulative = %state.cumulative_funding, "funding applied");
            self.emit(EventPayload::PerpetualFundingUpdate(FundingUpdateEvent {
                market_id: info.market_id,
                rate,
                cumulative_funding: state.cumulative_funding,
                timestamp: now,
            }));
            updated += 1;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use crate::events::EventPayload;
    use crate::market::MarketStatus;
    use rust_decimal_macros::dec;

    #[test]
    fn funding_runs_once_per_interval_boundary() {
        let mut h = Harness::new();
        let market = h.open_perp_positions(None);
        assert_eq!(h.engine.perpetual_info(&market).unwrap().unwrap().next_funding_timestamp, 3_600);

        h.next_block(1_800);
        assert_eq!(h.engine.funding_state(&market).unwrap().last_timestamp, 0);

        h.next_block(1_800);
        let state = h.engine.funding_state(&market).unwrap();
        assert_eq!(state.last_timestamp, 3_600);
        assert_eq!(h.engine.perpetual_info(&market).unwrap().unwrap().next_funding_timestamp, 7_200);
        let updates = h.events(|p| match p {
            EventPayload::PerpetualFundingUpdate(f) => Some(f.cumulative_funding),
            _ => None,
        });
        assert_eq!(updates, vec![state.cumulative_funding]);
        h.engine.check_invariants().unwrap();
    }

    #[test]
    fn paused_market_skips_the_interval() {
        let mut h = Harness::new();
        let market = h.derivative_market(dec!(50000), None);
        h.engine.update_market_status(h.admin, market, MarketStatus::Paused).unwrap();

        h.next_block(3_600);
        assert_eq!(h.engine.funding_state(&market).unwrap().last_timestamp, 0);
        assert_eq!(h.engine.perpetual_info(&market).unwrap().unwrap().next_funding_timestamp, 7_200);
        assert!(h.events(|p| matches!(p, EventPayload::PerpetualFundingUpdate(_)).then_some(())).is_empty());
    }
}
