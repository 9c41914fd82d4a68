//! Arithmetic filters
//!
//! All arithmetic runs on scale-preserving decimals. Inputs coerce through
//! [Value::to_number]-style rules via [TryFromValue](crate::value::TryFromValue),
//! so numeric strings work and argument mismatches are errors.

use super::FilterRegistry;
use crate::{
    error::RenderError,
    value::{Arguments, Value},
};
use rust_decimal::{Decimal, RoundingStrategy};

pub(super) fn register(registry: &mut FilterRegistry) {
    registry.register_fn("abs", abs);
    registry.register_fn("ceil", ceil);
    registry.register_fn("divided_by", divided_by);
    registry.register_fn("floor", floor);
    registry.register_fn("minus", minus);
    registry.register_fn("modulo", modulo);
    registry.register_fn("plus", plus);
    registry.register_fn("round", round);
    registry.register_fn("times", times);
}

fn abs(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_number().abs().into())
}

fn ceil(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_number().ceil().into())
}

fn floor(input: Value, arguments: Arguments) -> Result<Value, RenderError> {
    arguments.ensure_consumed()?;
    Ok(input.to_number().floor().into())
}

fn round(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let precision: Option<i64> = arguments.pop_optional()?;
    arguments.ensure_consumed()?;
    let precision = precision.unwrap_or(0).clamp(0, 28) as u32;
    // Liquid rounds halves away from zero, not to even
    Ok(input
        .to_number()
        .round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
        .into())
}

fn plus(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let addend: Decimal = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok((input.to_number() + addend).into())
}

fn minus(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let subtrahend: Decimal = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok((input.to_number() - subtrahend).into())
}

fn times(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let factor: Decimal = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    Ok((input.to_number() * factor).into())
}

/// Division. An integer divisor floors the quotient to an integer; a decimal
/// divisor divides exactly.
fn divided_by(
    input: Value,
    mut arguments: Arguments,
) -> Result<Value, RenderError> {
    let divisor: Decimal = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    let quotient = input
        .to_number()
        .checked_div(divisor)
        .ok_or(RenderError::DivisionByZero)?;
    if divisor.scale() == 0 {
        Ok(quotient.floor().into())
    } else {
        Ok(quotient.into())
    }
}

/// Remainder with Ruby's sign convention: the result takes the divisor's
/// sign
fn modulo(input: Value, mut arguments: Arguments) -> Result<Value, RenderError> {
    let divisor: Decimal = arguments.pop_position()?;
    arguments.ensure_consumed()?;
    let remainder = input
        .to_number()
        .checked_rem(divisor)
        .ok_or(RenderError::DivisionByZero)?;
    if !remainder.is_zero() && remainder.is_sign_negative() != divisor.is_sign_negative()
    {
        Ok((remainder + divisor).into())
    } else {
        Ok(remainder.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use sluice_util::assert_matches;

    fn apply(
        filter: fn(Value, Arguments) -> Result<Value, RenderError>,
        input: Value,
        position: Vec<Value>,
    ) -> Result<Value, RenderError> {
        filter(input, Arguments::new(position, Default::default()))
    }

    fn number(source: &str) -> Value {
        Value::Number(source.parse().unwrap())
    }

    #[rstest]
    #[case::abs_negative(abs, number("-3.5"), vec![], number("3.5"))]
    #[case::ceil(ceil, number("1.2"), vec![], number("2"))]
    #[case::floor(floor, number("1.8"), vec![], number("1"))]
    #[case::round(round, number("2.7"), vec![], number("3"))]
    #[case::round_precision(round, number("2.7183"), vec![2.into()], number("2.72"))]
    #[case::plus(plus, 1.into(), vec![2.into()], number("3"))]
    // Scale carries through arithmetic: 1 + 0.5 = 1.5
    #[case::plus_scale(plus, 1.into(), vec![number("0.5")], number("1.5"))]
    // Numeric strings coerce
    #[case::plus_string(plus, "4".into(), vec!["2".into()], number("6"))]
    #[case::minus(minus, 5.into(), vec![2.into()], number("3"))]
    #[case::times(times, number("1.5"), vec![4.into()], number("6.0"))]
    // Integer divisor floors the quotient
    #[case::divided_by_int(divided_by, 7.into(), vec![2.into()], number("3"))]
    #[case::divided_by_int_negative(divided_by, (-7).into(), vec![2.into()], number("-4"))]
    #[case::divided_by_decimal(divided_by, 7.into(), vec![number("2.0")], number("3.5"))]
    #[case::modulo(modulo, 7.into(), vec![3.into()], number("1"))]
    // Ruby sign convention: -7 % 3 == 2
    #[case::modulo_negative(modulo, (-7).into(), vec![3.into()], number("2"))]
    fn test_math_filter(
        #[case] filter: fn(Value, Arguments) -> Result<Value, RenderError>,
        #[case] input: Value,
        #[case] position: Vec<Value>,
        #[case] expected: Value,
    ) {
        assert_eq!(apply(filter, input, position).unwrap(), expected);
    }

    #[rstest]
    #[case::divide(divided_by)]
    #[case::modulo(modulo)]
    fn test_division_by_zero(
        #[case] filter: fn(Value, Arguments) -> Result<Value, RenderError>,
    ) {
        assert_matches!(
            apply(filter, 1.into(), vec![0.into()]),
            Err(RenderError::DivisionByZero),
        );
    }

    /// Non-numeric arguments are argument errors, not silent zeros
    #[test]
    fn test_bad_argument() {
        assert_matches!(
            apply(plus, 1.into(), vec![Value::Array(vec![])]),
            Err(RenderError::Argument { .. }),
        );
    }
}
