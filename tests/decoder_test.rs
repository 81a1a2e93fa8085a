// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use proptest::prelude::*;
use rs485_acquisition::decoder::{
    combine_words, decode, encode, words_to_bytes, ByteOrder, DataType, DecodeError,
};

fn byte_order() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::Big), Just(ByteOrder::Little)]
}

proptest! {
    #[test]
    fn uint16_round_trip(v in any::<u16>(), order in byte_order()) {
        let v = f64::from(v);
        prop_assert_eq!(decode(&encode(v, DataType::Uint16, order), DataType::Uint16, order)?, v);
    }

    #[test]
    fn int16_round_trip(v in any::<i16>(), order in byte_order()) {
        let v = f64::from(v);
        prop_assert_eq!(decode(&encode(v, DataType::Int16, order), DataType::Int16, order)?, v);
    }

    #[test]
    fn uint32_round_trip(v in any::<u32>(), order in byte_order()) {
        let v = f64::from(v);
        prop_assert_eq!(decode(&encode(v, DataType::Uint32, order), DataType::Uint32, order)?, v);
    }

    #[test]
    fn int32_round_trip(v in any::<i32>(), order in byte_order()) {
        let v = f64::from(v);
        prop_assert_eq!(decode(&encode(v, DataType::Int32, order), DataType::Int32, order)?, v);
    }

    #[test]
    fn float32_round_trip(v in any::<f32>().prop_filter("finite", |v| v.is_finite()), order in byte_order()) {
        let v = f64::from(v);
        prop_assert_eq!(decode(&encode(v, DataType::Float32, order), DataType::Float32, order)?, v);
    }

    #[test]
    fn float64_round_trip(v in any::<f64>().prop_filter("finite", |v| v.is_finite()), order in byte_order()) {
        prop_assert_eq!(decode(&encode(v, DataType::Float64, order), DataType::Float64, order)?, v);
    }

    #[test]
    fn big_endian_words_compose_high_first(high in any::<u16>(), low in any::<u16>()) {
        let bytes = words_to_bytes(&[high, low]);
        prop_assert_eq!(
            decode(&bytes, DataType::Uint32, ByteOrder::Big)?,
            f64::from(combine_words(high, low))
        );
    }

    #[test]
    fn short_payload_is_insufficient(len in 0usize..8) {
        let bytes = vec![0u8; len];
        match decode(&bytes, DataType::Float64, ByteOrder::Big) {
            Err(DecodeError::InsufficientData { expected, actual }) => {
                prop_assert_eq!(expected, 8);
                prop_assert_eq!(actual, len);
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}
