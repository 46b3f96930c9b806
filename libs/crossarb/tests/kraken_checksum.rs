//! Book integrity: checksum string construction and CRC over a full
//! ten-level fixture.

use crossarb::domain::orderbook::PriceLevel;
use crossarb::infrastructure::venue::kraken::{
    checksum_fragment, compute_book_checksum, format_checksum_price, format_checksum_qty,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn level(price: Decimal, qty: Decimal) -> PriceLevel {
    PriceLevel::new(price, qty)
}

#[test]
fn price_formatting_matches_documented_examples() {
    // "45285.2" -> "452852"
    assert_eq!(format_checksum_price(dec!(45285.2), 1), "452852");
    // "0.00100000" -> "100000"
    assert_eq!(format_checksum_qty(dec!(0.001)), "100000");
}

#[test]
fn full_ten_level_fixture_builds_the_expected_string() {
    // Asks ascending 100.1..101.0, bids descending 100.0..99.1, qty 1 each.
    let asks: Vec<PriceLevel> = (1..=10)
        .map(|i| level(dec!(100.0) + Decimal::new(i, 1), dec!(1)))
        .collect();
    let bids: Vec<PriceLevel> = (0..10)
        .map(|i| level(dec!(100.0) - Decimal::new(i, 1), dec!(1)))
        .collect();

    let qty = "100000000"; // 1.00000000 with the dot removed
    let expected_asks: String = (1..=10)
        .map(|i| format!("{}{}", 1000 + i, qty))
        .collect();
    let expected_bids: String = (0..10)
        .map(|i| format!("{}{}", 1000 - i, qty))
        .collect();

    assert_eq!(checksum_fragment(&asks, 1), expected_asks);
    assert_eq!(checksum_fragment(&bids, 1), expected_bids);

    let expected = format!("{expected_asks}{expected_bids}");
    assert_eq!(
        compute_book_checksum(&asks, &bids, 1),
        crc32fast::hash(expected.as_bytes())
    );
}

/// The venue-published reference book: ten levels per side with checksum
/// 3310070434 as sent on the wire.
fn reference_book() -> (Vec<PriceLevel>, Vec<PriceLevel>) {
    let asks = vec![
        level(dec!(45285.2), dec!(0.00100000)),
        level(dec!(45286.4), dec!(1.54571953)),
        level(dec!(45286.6), dec!(1.54571109)),
        level(dec!(45289.6), dec!(1.54560911)),
        level(dec!(45290.2), dec!(0.15890660)),
        level(dec!(45291.8), dec!(1.54553491)),
        level(dec!(45294.7), dec!(0.04454749)),
        level(dec!(45296.1), dec!(0.35380000)),
        level(dec!(45297.5), dec!(0.09945542)),
        level(dec!(45299.5), dec!(0.18772827)),
    ];
    let bids = vec![
        level(dec!(45283.5), dec!(0.10000000)),
        level(dec!(45283.4), dec!(1.54582015)),
        level(dec!(45282.1), dec!(0.10000000)),
        level(dec!(45281.0), dec!(0.10000000)),
        level(dec!(45280.3), dec!(1.54592586)),
        level(dec!(45279.0), dec!(0.07990000)),
        level(dec!(45277.6), dec!(0.03310103)),
        level(dec!(45277.5), dec!(0.30000000)),
        level(dec!(45277.3), dec!(1.54602737)),
        level(dec!(45276.6), dec!(0.15445238)),
    ];
    (asks, bids)
}

#[test]
fn venue_published_fixture_matches_checksum_3310070434() {
    let (asks, bids) = reference_book();

    let expected_asks = "45285210000045286415457195345286615457110945289615456091145290215890660452918154553491452947445474945296135380000452975994554245299518772827";
    let expected_bids = "452835100000004528341545820154528211000000045281010000000452803154592586452790799000045277633101034527753000000045277315460273745276615445238";
    assert_eq!(checksum_fragment(&asks, 1), expected_asks);
    assert_eq!(checksum_fragment(&bids, 1), expected_bids);

    assert_eq!(compute_book_checksum(&asks, &bids, 1), 3310070434);
}

#[test]
fn fragment_ignores_levels_beyond_ten() {
    let asks: Vec<PriceLevel> = (1..=15)
        .map(|i| level(dec!(100.0) + Decimal::new(i, 1), dec!(1)))
        .collect();
    let truncated = checksum_fragment(&asks, 1);
    let first_ten = checksum_fragment(&asks[..10], 1);
    assert_eq!(truncated, first_ten);
}

#[test]
fn small_quantities_strip_to_documented_form() {
    // 5.325e-05 -> "0.00005325" -> "5325"
    assert_eq!(format_checksum_qty(dec!(0.00005325)), "5325");
    // Prices below one lose their integer zero.
    assert_eq!(format_checksum_price(dec!(0.1234), 4), "1234");
}

#[test]
fn checksum_is_sensitive_to_quantity_changes() {
    let asks = [level(dec!(100.1), dec!(1))];
    let bids = [level(dec!(100.0), dec!(1))];
    let a = compute_book_checksum(&asks, &bids, 1);
    let changed = [level(dec!(100.1), dec!(2))];
    let b = compute_book_checksum(&changed, &bids, 1);
    assert_ne!(a, b);
}

#[test]
fn crc_seed_zero_reference_vector() {
    assert_eq!(crc32fast::hash(b"123456789"), 0xCBF43926);
}
