//! Weighted-average-cost accounting kernel.
//!
//! # Rules
//!
//! For a fill of `qty` at `price` against a position with signed `net_qty`
//! and basis `avg_cost`:
//!
//! - **Extend** (same direction, or flat): the basis re-averages,
//!   `avg' = (|net| * avg + qty * price) / (|net| + qty)`, rounded to the
//!   nearest micro. No PnL is realized.
//! - **Reduce** (opposite direction, `qty ≤ |net|`): realizes
//!   `(price − avg) × closed × direction` (direction +1 long, −1 short);
//!   the basis is unchanged. A full close zeroes the basis.
//! - **Flip** (opposite direction, `qty > |net|`): the open quantity is
//!   closed as above, then the remainder opens a new lot at the fill price,
//!   which becomes the new basis.
//!
//! All arithmetic uses `i128` intermediates clamped back to `i64`.
//! Deterministic, pure, no IO: two positions fed the same fill stream always
//! land in identical state.

use tpx_schemas::Side;

use crate::types::Position;

fn i128_to_i64_clamp(x: i128) -> i64 {
    if x > i64::MAX as i128 {
        i64::MAX
    } else if x < i64::MIN as i128 {
        i64::MIN
    } else {
        x as i64
    }
}

/// Quantity-weighted average of an existing basis and a new lot, rounded to
/// the nearest micro.
fn weighted_avg(open_qty: i64, avg_micros: i64, add_qty: i64, price_micros: i64) -> i64 {
    debug_assert!(open_qty >= 0 && add_qty > 0);
    let num =
        (open_qty as i128) * (avg_micros as i128) + (add_qty as i128) * (price_micros as i128);
    let den = (open_qty + add_qty) as i128;
    // round-half-up for non-negative numerators, half-down for negative
    let rounded = if num >= 0 {
        (num + den / 2) / den
    } else {
        (num - den / 2) / den
    };
    i128_to_i64_clamp(rounded)
}

/// Realized PnL in micros for closing `closed_qty` of a position with the
/// given basis at `price_micros`. `position_sign` is +1 for long, -1 for
/// short.
fn realized_on_close(closed_qty: i64, avg_micros: i64, price_micros: i64, position_sign: i64) -> i64 {
    let pnl = (price_micros as i128 - avg_micros as i128)
        * (closed_qty as i128)
        * (position_sign as i128);
    i128_to_i64_clamp(pnl)
}

/// Apply one fill to `pos` under weighted-average-cost rules.
///
/// `qty` must be positive; `price_micros` must be positive. The caller is
/// responsible for duplicate suppression — this function applies
/// unconditionally.
pub fn apply(pos: &mut Position, side: Side, qty: i64, price_micros: i64) {
    debug_assert!(qty > 0);
    debug_assert!(price_micros > 0);

    let signed = side.sign() * qty;

    if pos.net_qty == 0 || pos.net_qty.signum() == signed.signum() {
        // Extend (or open from flat): re-average the basis.
        pos.avg_cost_micros = weighted_avg(pos.net_qty.abs(), pos.avg_cost_micros, qty, price_micros);
        pos.net_qty += signed;
        return;
    }

    let position_sign = pos.net_qty.signum();
    let open_abs = pos.net_qty.abs();

    if qty <= open_abs {
        // Reduce: realize on the closed quantity, basis unchanged.
        pos.realized_pnl_micros = pos.realized_pnl_micros.saturating_add(realized_on_close(
            qty,
            pos.avg_cost_micros,
            price_micros,
            position_sign,
        ));
        pos.net_qty += signed;
        if pos.net_qty == 0 {
            pos.avg_cost_micros = 0;
        }
    } else {
        // Flip: close the whole open quantity, then open the remainder as a
        // new lot at the fill price.
        pos.realized_pnl_micros = pos.realized_pnl_micros.saturating_add(realized_on_close(
            open_abs,
            pos.avg_cost_micros,
            price_micros,
            position_sign,
        ));
        let remainder = qty - open_abs;
        pos.net_qty = -position_sign * remainder;
        pos.avg_cost_micros = price_micros;
    }
}

/// Recompute `unrealized_pnl_micros` for `pos` from a mark price:
/// `net_qty × (mark − avg_cost)`.
pub fn mark(pos: &mut Position, mark_micros: i64) {
    let pnl =
        (pos.net_qty as i128) * (mark_micros as i128 - pos.avg_cost_micros as i128);
    pos.unrealized_pnl_micros = i128_to_i64_clamp(pnl);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpx_schemas::MICROS_PER_UNIT;

    const M: i64 = MICROS_PER_UNIT;

    fn pos() -> Position {
        Position::new("acct-1", "AAPL")
    }

    #[test]
    fn open_from_flat_sets_basis_to_fill_price() {
        let mut p = pos();
        apply(&mut p, Side::Buy, 10, 100 * M);
        assert_eq!(p.net_qty, 10);
        assert_eq!(p.avg_cost_micros, 100 * M);
        assert_eq!(p.realized_pnl_micros, 0);
    }

    #[test]
    fn extend_reaverages_basis() {
        let mut p = pos();
        apply(&mut p, Side::Buy, 60, 49_900_000); // 60 @ $49.90
        apply(&mut p, Side::Buy, 40, 50_000_000); // 40 @ $50.00
        assert_eq!(p.net_qty, 100);
        // (60*49.90 + 40*50.00) / 100 = 49.94
        assert_eq!(p.avg_cost_micros, 49_940_000);
        assert_eq!(p.realized_pnl_micros, 0);
    }

    #[test]
    fn partial_close_realizes_proportionally() {
        let mut p = pos();
        apply(&mut p, Side::Buy, 20, 300 * M);
        apply(&mut p, Side::Sell, 5, 310 * M);
        assert_eq!(p.net_qty, 15);
        // basis unchanged on reduce
        assert_eq!(p.avg_cost_micros, 300 * M);
        // realized = (310-300)*5 = $50
        assert_eq!(p.realized_pnl_micros, 50 * M);
    }

    #[test]
    fn full_close_zeroes_basis() {
        let mut p = pos();
        apply(&mut p, Side::Buy, 10, 200 * M);
        apply(&mut p, Side::Sell, 10, 210 * M);
        assert!(p.is_flat());
        assert_eq!(p.avg_cost_micros, 0);
        assert_eq!(p.realized_pnl_micros, 100 * M);
    }

    #[test]
    fn short_side_realizes_inverted() {
        let mut p = pos();
        apply(&mut p, Side::Sell, 10, 50 * M); // short 10 @ $50
        assert_eq!(p.net_qty, -10);
        assert_eq!(p.avg_cost_micros, 50 * M);
        apply(&mut p, Side::Buy, 10, 45 * M); // cover @ $45
        assert!(p.is_flat());
        // realized = (50-45)*10 = $50
        assert_eq!(p.realized_pnl_micros, 50 * M);
    }

    #[test]
    fn flip_realizes_then_opens_at_fill_price() {
        let mut p = pos();
        apply(&mut p, Side::Buy, 10, 100 * M);
        apply(&mut p, Side::Sell, 15, 110 * M);
        // closed 10 long: realized (110-100)*10 = $100
        assert_eq!(p.realized_pnl_micros, 100 * M);
        // remainder opens short 5 @ $110
        assert_eq!(p.net_qty, -5);
        assert_eq!(p.avg_cost_micros, 110 * M);
    }

    #[test]
    fn net_qty_is_signed_sum_of_fills() {
        let mut p = pos();
        apply(&mut p, Side::Buy, 30, 10 * M);
        apply(&mut p, Side::Sell, 12, 11 * M);
        apply(&mut p, Side::Buy, 7, 12 * M);
        assert_eq!(p.net_qty, 30 - 12 + 7);
    }

    #[test]
    fn mark_computes_unrealized_long() {
        let mut p = pos();
        apply(&mut p, Side::Buy, 10, 100 * M);
        mark(&mut p, 115 * M);
        assert_eq!(p.unrealized_pnl_micros, 150 * M);
    }

    #[test]
    fn mark_computes_unrealized_short() {
        let mut p = pos();
        apply(&mut p, Side::Sell, 10, 100 * M);
        mark(&mut p, 90 * M);
        // short gains when the mark drops: -10 * (90-100) = +$100
        assert_eq!(p.unrealized_pnl_micros, 100 * M);
    }

    #[test]
    fn weighted_avg_rounds_to_nearest_micro() {
        // 1 @ 1 micro + 2 @ 2 micros => 5/3 micros => rounds to 2
        assert_eq!(weighted_avg(1, 1, 2, 2), 2);
    }
}
