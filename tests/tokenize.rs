use spmtok::convert::{convert_tokenizer_json, ConvertOptions};
use spmtok::{
    decode_string, encode_string, DecoderStatus, EncodeOptions, Encoder, EncoderConfigBuilder,
    EncoderStatus,
};

const PLAIN: EncodeOptions = EncodeOptions {
    add_bos: false,
    add_eos: false,
    reverse: false,
};

fn sentencepiece_like() -> Vec<u8> {
    let mut b = EncoderConfigBuilder::new();
    b.unknown_piece("<unk>");
    let bos = b.control_piece("<s>");
    let eos = b.control_piece("</s>");
    b.start_code(bos)
        .end_code(eos)
        .add_dummy_prefix(true)
        .remove_extra_whitespaces(true)
        .escape_whitespaces(true)
        .normalization_rule("\u{ff0c}", ",")
        .normalization_rule("\u{3000}", " ");
    for (piece, score) in [
        ("\u{2581}", -3.0),
        ("\u{2581}the", -2.0),
        ("\u{2581}quick", -4.0),
        ("\u{2581}brown", -4.5),
        ("\u{2581}fox", -4.2),
        ("qu", -5.0),
        ("ick", -5.5),
        (",", -2.5),
        ("t", -6.0),
        ("h", -6.0),
        ("e", -6.0),
    ] {
        b.piece(piece, score);
    }
    b.build().unwrap()
}

#[test]
fn end_to_end_with_normalization() {
    let blob = sentencepiece_like();
    let input = "the\u{3000}quick\u{ff0c}  brown fox ";
    let r = encode_string(input.as_bytes(), &blob, PLAIN);
    assert_eq!(r.status, EncoderStatus::Success);
    // <unk>=0 <s>=1 </s>=2 ▁=3 ▁the=4 ▁quick=5 ▁brown=6 ▁fox=7 ... ,=10
    assert_eq!(r.codes, vec![4, 5, 10, 6, 7]);
    assert_eq!(r.offsets, vec![0, 3, 11, 14, 21]);
}

#[test]
fn control_codes_wrap_the_pieces() {
    let blob = sentencepiece_like();
    let options = EncodeOptions {
        add_bos: true,
        add_eos: true,
        reverse: false,
    };
    let r = encode_string(b"the fox", &blob, options);
    assert_eq!(r.codes, vec![1, 4, 7, 2]);
    // "▁the▁fox" is 12 normalized bytes.
    assert_eq!(r.offsets, vec![0, 0, 3, 12]);

    let reversed = encode_string(b"the fox", &blob, EncodeOptions { reverse: true, ..options });
    let mut codes = r.codes.clone();
    codes.reverse();
    assert_eq!(reversed.codes, codes);
}

#[test]
fn encoding_is_deterministic_and_offsets_stay_in_bounds() {
    let blob = sentencepiece_like();
    let inputs = [
        "the quick brown fox",
        "  leading and trailing  ",
        "\u{3000}\u{3000}the\u{ff0c}fox",
        "zzz unknown \u{1f600} bytes",
        "",
        "\t\n",
    ];
    for input in inputs {
        let first = encode_string(input.as_bytes(), &blob, PLAIN);
        let second = encode_string(input.as_bytes(), &blob, PLAIN);
        assert_eq!(first, second, "input {input:?}");
        assert_eq!(first.codes.len(), first.offsets.len());
        assert!(first.offsets.iter().all(|&o| o <= input.len()), "input {input:?}");
        assert!(first.offsets.windows(2).all(|w| w[0] <= w[1]), "input {input:?}");
    }
}

#[test]
fn unknown_bytes_are_grouped() {
    let blob = sentencepiece_like();
    let r = encode_string("the \u{1f600}".as_bytes(), &blob, PLAIN);
    // ▁the, ▁, then one unknown code for the four emoji bytes.
    assert_eq!(r.codes, vec![4, 3, 0]);
    assert_eq!(r.offsets, vec![0, 3, 4]);
}

#[test]
fn threads_share_one_config() {
    let blob = sentencepiece_like();
    let encoder = Encoder::from_bytes(&blob).unwrap();
    let expected = encoder.encode(b"the quick brown fox", PLAIN);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    assert_eq!(encoder.encode(b"the quick brown fox", PLAIN), expected);
                }
            });
        }
    });

    let texts = vec!["the quick brown fox"; 64];
    assert!(encoder
        .encode_batch(&texts, PLAIN)
        .iter()
        .all(|r| *r == expected));
}

#[test]
fn corrupted_blobs_report_wrong_config() {
    let blob = sentencepiece_like();
    for cut in [0, 3, 20, blob.len() - 1] {
        let r = encode_string(b"the fox", &blob[..cut], PLAIN);
        assert_eq!(r.status, EncoderStatus::WrongConfig, "cut at {cut}");
        assert!(r.codes.is_empty());
    }
}

const TOKENIZER_JSON: &str = r#"{
  "added_tokens": [
    {"id": 0, "content": "<unk>", "special": true},
    {"id": 1, "content": "<s>", "special": true},
    {"id": 2, "content": "</s>", "special": true}
  ],
  "normalizer": {"type": "Sequence", "normalizers": [
    {"type": "Replace", "pattern": {"Regex": " {2,}"}, "content": " "}
  ]},
  "pre_tokenizer": {"type": "Metaspace", "replacement": "▁", "add_prefix_space": true},
  "post_processor": null,
  "model": {
    "type": "Unigram",
    "unk_id": 0,
    "vocab": [
      ["<unk>", 0.0], ["<s>", 0.0], ["</s>", 0.0],
      ["▁", -2.0], ["▁hello", -3.0], ["▁world", -3.5], ["!", -2.0]
    ]
  }
}"#;

#[test]
fn converted_model_round_trips_through_the_decoder() {
    let model = convert_tokenizer_json(TOKENIZER_JSON, ConvertOptions::default()).unwrap();
    let options = EncodeOptions {
        add_bos: true,
        add_eos: true,
        reverse: false,
    };
    let r = encode_string(b"hello   world!", &model.encoder, options);
    // No post-processor: BOS/EOS fall back to <s> and </s>.
    assert_eq!(r.codes, vec![1, 4, 5, 6, 2]);

    let decoded = decode_string(&r.codes, &model.decoder);
    assert_eq!(decoded.status, DecoderStatus::Success);
    assert_eq!(decoded.text, "hello world!");
}

#[test]
fn converted_model_decodes_unknown_marker() {
    let model = convert_tokenizer_json(TOKENIZER_JSON, ConvertOptions { encoding_offset: 3 }).unwrap();
    let r = encode_string(b"hello ?", &model.encoder, PLAIN);
    assert_eq!(r.codes, vec![4 + 3, 3 + 3, 0]);
    let decoded = decode_string(&r.codes, &model.decoder);
    assert_eq!(decoded.text, "hello  \u{2047} ");

    assert_eq!(
        decode_string(&[99], &model.decoder).status,
        DecoderStatus::InvalidInput
    );
    assert_eq!(
        decode_string(&[4], &model.decoder[..8]).status,
        DecoderStatus::WrongConfig
    );
}
