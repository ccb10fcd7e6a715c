//! Re-frames raw Opus packets into an Ogg bitstream.
//!
//! Every packet gets its own page. The first two pages carry synthesized
//! `OpusHead` and `OpusTags` headers so the output is playable on its own.

use bytes::{BufMut, Bytes, BytesMut};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;
const MAX_SEGMENTS: usize = 255;
const MAX_PAGE_PAYLOAD: usize = MAX_SEGMENTS * 255;

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

/// 20 ms at 48 kHz.
pub const SAMPLES_PER_PACKET: u64 = 960;
const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u8 = 2;
const PRE_SKIP: u16 = 312;
const VENDOR: &str = "device-hub";

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04C1_1DB7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

/// CRC-32 as used by Ogg: polynomial 0x04C11DB7, no reflection, zero init.
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, byte| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ byte) as usize]
    })
}

/// Page state for one logical bitstream. Create one per stream.
#[derive(Debug)]
pub struct OggFramer {
    serial: u32,
    sequence: u32,
    granule: u64,
    headers_written: bool,
    finished: bool,
}

impl OggFramer {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            sequence: 0,
            granule: 0,
            headers_written: false,
            finished: false,
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn granule(&self) -> u64 {
        self.granule
    }

    /// Frames one Opus packet. The header pages are prepended to the first
    /// call's output.
    pub fn frame(&mut self, packet: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        if !self.headers_written {
            self.write_headers(&mut out);
        }
        self.granule += SAMPLES_PER_PACKET;
        self.write_packet(&mut out, packet, 0, self.granule);
        out.freeze()
    }

    /// Closing page with the EOS flag. Returns `None` if already finished.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        let mut out = BytesMut::new();
        if !self.headers_written {
            self.write_headers(&mut out);
        }
        self.finished = true;
        self.write_page(&mut out, FLAG_EOS, self.granule, &[], &[]);
        Some(out.freeze())
    }

    fn write_headers(&mut self, out: &mut BytesMut) {
        self.headers_written = true;
        self.write_packet(out, &opus_head(), FLAG_BOS, 0);
        self.write_packet(out, &opus_tags(), 0, 0);
    }

    fn write_packet(&mut self, out: &mut BytesMut, packet: &[u8], first_flags: u8, granule: u64) {
        if packet.len() < MAX_PAGE_PAYLOAD {
            let lacing = lacing_for(packet.len(), true);
            self.write_page(out, first_flags, granule, &lacing, packet);
            return;
        }

        // Oversized packets span pages; only the page that completes the
        // packet carries a granule.
        let mut chunks = packet.chunks(MAX_PAGE_PAYLOAD).peekable();
        let mut flags = first_flags;
        while let Some(chunk) = chunks.next() {
            let completes = chunks.peek().is_none() && chunk.len() < MAX_PAGE_PAYLOAD;
            let lacing = lacing_for(chunk.len(), completes);
            let page_granule = if completes { granule } else { u64::MAX };
            self.write_page(out, flags, page_granule, &lacing, chunk);
            flags = FLAG_CONTINUED;
        }
        if packet.len() % MAX_PAGE_PAYLOAD == 0 {
            self.write_page(out, FLAG_CONTINUED, granule, &[0], &[]);
        }
    }

    fn write_page(
        &mut self,
        out: &mut BytesMut,
        flags: u8,
        granule: u64,
        lacing: &[u8],
        payload: &[u8],
    ) {
        let start = out.len();
        out.reserve(HEADER_LEN + lacing.len() + payload.len());
        out.put_slice(CAPTURE_PATTERN);
        out.put_u8(0);
        out.put_u8(flags);
        out.put_u64_le(granule);
        out.put_u32_le(self.serial);
        out.put_u32_le(self.sequence);
        out.put_u32_le(0);
        out.put_u8(lacing.len() as u8);
        out.put_slice(lacing);
        out.put_slice(payload);

        let crc = crc32(&out[start..]);
        out[start + 22..start + 26].copy_from_slice(&crc.to_le_bytes());
        self.sequence = self.sequence.wrapping_add(1);
    }
}

fn lacing_for(len: usize, terminated: bool) -> Vec<u8> {
    let mut lacing = vec![255u8; len / 255];
    if terminated || len % 255 != 0 {
        lacing.push((len % 255) as u8);
    }
    lacing
}

fn opus_head() -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(CHANNELS);
    head.extend_from_slice(&PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);
    head
}

fn opus_tags() -> Vec<u8> {
    let mut tags = Vec::with_capacity(16 + VENDOR.len());
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    tags.extend_from_slice(VENDOR.as_bytes());
    tags.extend_from_slice(&0u32.to_le_bytes());
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Page {
        flags: u8,
        granule: u64,
        serial: u32,
        sequence: u32,
        payload: Vec<u8>,
    }

    fn parse_pages(mut data: &[u8]) -> Vec<Page> {
        let mut pages = Vec::new();
        while !data.is_empty() {
            assert_eq!(&data[..4], CAPTURE_PATTERN);
            assert_eq!(data[4], 0, "version");
            let segments = data[26] as usize;
            let lacing = &data[27..27 + segments];
            let body_len: usize = lacing.iter().map(|l| *l as usize).sum();
            let total = HEADER_LEN + segments + body_len;

            let mut zeroed = data[..total].to_vec();
            zeroed[22..26].fill(0);
            let stored = u32::from_le_bytes(data[22..26].try_into().unwrap());
            assert_eq!(crc32(&zeroed), stored, "page crc");

            pages.push(Page {
                flags: data[5],
                granule: u64::from_le_bytes(data[6..14].try_into().unwrap()),
                serial: u32::from_le_bytes(data[14..18].try_into().unwrap()),
                sequence: u32::from_le_bytes(data[18..22].try_into().unwrap()),
                payload: data[27 + segments..total].to_vec(),
            });
            data = &data[total..];
        }
        pages
    }

    #[test_timeout::timeout]
    fn crc_matches_reference_vector() {
        // CRC-32/POSIX check value before its final inversion.
        assert_eq!(crc32(b"123456789"), !0x765E_7680);
        assert_eq!(crc32(b""), 0);
        assert_eq!(CRC_TABLE[1], 0x04C1_1DB7);
    }

    #[test_timeout::timeout]
    fn first_output_carries_header_pages() {
        let mut framer = OggFramer::new(7);
        let bytes = framer.frame(&[0xfc, 1, 2, 3]);
        let pages = parse_pages(&bytes);
        assert_eq!(pages.len(), 3);

        assert_eq!(pages[0].flags, FLAG_BOS);
        assert!(pages[0].payload.starts_with(b"OpusHead"));
        assert_eq!(pages[0].granule, 0);
        assert!(pages[1].payload.starts_with(b"OpusTags"));
        assert_eq!(pages[1].granule, 0);

        assert_eq!(pages[2].flags, 0);
        assert_eq!(pages[2].payload, vec![0xfc, 1, 2, 3]);
        assert_eq!(pages[2].granule, SAMPLES_PER_PACKET);
        assert!(pages.iter().all(|page| page.serial == 7));
        assert_eq!(
            pages.iter().map(|page| page.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test_timeout::timeout]
    fn granule_and_sequence_advance_per_packet() {
        let mut framer = OggFramer::new(1);
        framer.frame(&[1; 10]);
        let second = parse_pages(&framer.frame(&[2; 300]));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sequence, 3);
        assert_eq!(second[0].granule, 2 * SAMPLES_PER_PACKET);
        assert_eq!(second[0].payload.len(), 300);

        let end = parse_pages(&framer.finish().unwrap());
        assert_eq!(end[0].flags, FLAG_EOS);
        assert_eq!(end[0].sequence, 4);
        assert_eq!(end[0].granule, 2 * SAMPLES_PER_PACKET);
        assert!(framer.finish().is_none());
    }

    #[test_timeout::timeout]
    fn separate_streams_keep_separate_counters() {
        let mut first = OggFramer::new(1);
        let mut second = OggFramer::new(2);
        for _ in 0..5 {
            first.frame(&[0; 20]);
        }
        let pages = parse_pages(&second.frame(&[0; 20]));
        assert_eq!(pages[0].sequence, 0);
        assert_eq!(pages[0].flags, FLAG_BOS);
        assert_eq!(pages[2].granule, SAMPLES_PER_PACKET);
        assert_eq!(first.granule(), 5 * SAMPLES_PER_PACKET);
    }

    #[test_timeout::timeout]
    fn oversized_packets_span_continued_pages() {
        let mut framer = OggFramer::new(3);
        let packet = vec![9u8; MAX_PAGE_PAYLOAD + 100];
        let pages = parse_pages(&framer.frame(&packet));
        let data: Vec<&Page> = pages.iter().skip(2).collect();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].granule, u64::MAX);
        assert_eq!(data[1].flags, FLAG_CONTINUED);
        assert_eq!(data[1].granule, SAMPLES_PER_PACKET);
        assert_eq!(data[0].payload.len() + data[1].payload.len(), packet.len());
    }

    #[test_timeout::timeout]
    fn lacing_terminates_exact_multiples() {
        assert_eq!(lacing_for(255, true), vec![255, 0]);
        assert_eq!(lacing_for(10, true), vec![10]);
        assert_eq!(lacing_for(0, true), vec![0]);
    }
}
