// SDP codec and candidate parsing benchmarks
// Measures the per-message cost of the interchange formats on the signaling path

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rtc_peer::{IceCandidate, SdpDocument, SdpType, SessionDescription};

fn media_section(index: usize) -> String {
    let (media, protocol, formats) = match index % 3 {
        0 => ("audio", "UDP/TLS/RTP/SAVPF", "111 0"),
        1 => ("video", "UDP/TLS/RTP/SAVPF", "96 97"),
        _ => ("application", "UDP/DTLS/SCTP", "webrtc-datachannel"),
    };
    let port = 50000 + index;
    format!(
        "m={media} 9 {protocol} {formats}\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:Wf3k\r\n\
a=ice-pwd:x9bq3KjvTcrgJv0n9dCFUnTp\r\n\
a=fingerprint:sha-256 0F:74:31:25:CB:A2:13:EC:5E:2B:A0:99:10:34:55:C2\r\n\
a=setup:actpass\r\n\
a=mid:{index}\r\n\
a=sendrecv\r\n\
a=candidate:1 1 udp 2122260223 192.168.1.{index} {port} typ host\r\n"
    )
}

fn create_offer_text(sections: usize) -> String {
    let mids: Vec<String> = (0..sections).map(|i| i.to_string()).collect();
    let mut text = format!(
        "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE {}\r\n",
        mids.join(" ")
    );
    for index in 0..sections {
        text.push_str(&media_section(index));
    }
    text
}

fn bench_sdp_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("sdp_parse");

    for sections in [1, 3, 12] {
        let text = create_offer_text(sections);
        group.bench_with_input(BenchmarkId::from_parameter(sections), &text, |b, text| {
            b.iter(|| black_box(SdpDocument::parse(black_box(text)).unwrap()));
        });
    }

    group.finish();
}

fn bench_sdp_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("sdp_serialize");

    for sections in [1, 3, 12] {
        let document = SdpDocument::parse(&create_offer_text(sections)).unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(sections),
            &document,
            |b, document| {
                b.iter(|| black_box(document.serialize()));
            },
        );
    }

    group.finish();
}

fn bench_description_json(c: &mut Criterion) {
    let description = SessionDescription::parse(SdpType::Offer, &create_offer_text(3)).unwrap();
    let json = description.to_json().unwrap();

    c.bench_function("description_to_json", |b| {
        b.iter(|| black_box(description.to_json().unwrap()));
    });

    c.bench_function("description_from_json", |b| {
        b.iter(|| black_box(SessionDescription::from_json(black_box(&json)).unwrap()));
    });
}

fn bench_candidate_parse(c: &mut Criterion) {
    let host = IceCandidate::new(
        "candidate:842163049 1 udp 1677729535 192.168.1.20 50000 typ host generation 0",
        "0",
        0,
    );
    let srflx = IceCandidate::new(
        "candidate:842163049 1 udp 1677729535 203.0.113.7 61234 typ srflx raddr 192.168.1.20 rport 50000 generation 0 network-cost 999",
        "0",
        0,
    );

    let mut group = c.benchmark_group("candidate_parse");
    group.bench_function("host", |b| b.iter(|| black_box(host.parse().unwrap())));
    group.bench_function("srflx", |b| b.iter(|| black_box(srflx.parse().unwrap())));
    group.finish();
}

criterion_group!(
    benches,
    bench_sdp_parse,
    bench_sdp_serialize,
    bench_description_json,
    bench_candidate_parse
);
criterion_main!(benches);
