//! SIS3316 binary event decoding.
//!
//! Output files are a plain concatenation of event records as read from the
//! device memory. A record is a sequence of little-endian 32-bit words:
//!
//! ```text
//! word 0    bits 0-3 format mask, bits 4-15 channel id, bits 16-31 timestamp high
//! word 1    timestamp low
//! [7 words] format bit 0: peak height (low 16 bits of the first word) and accumulators
//! [2 words] format bit 1: accumulators 7 and 8
//! [3 words] format bit 2: MAW maximum, before and after trigger
//! [2 words] format bit 3: energy values
//! trailer   0xE in bits 28-31, MAW test flag in bit 27, raw sample words in bits 0-25
//! raw       two 16-bit samples per word
//! [maw]     MAW test buffer, present when the flag is set
//! ```
//!
//! The files are read while the readout worker is still appending to them, so the
//! decoder must cope with a record cut in half at the end of the file. Incomplete
//! records stay buffered until the rest arrives.

use crate::error::{AppResult, DaqError};
use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read};

const WORD: usize = 4;
const READ_CHUNK: usize = 64 * 1024;
const TRAILER_MAGIC: u32 = 0xE;
const MAW_TEST_FLAG: u32 = 1 << 27;
const RAW_WORDS_MASK: u32 = 0x03FF_FFFF;

/// Words contributed by each format mask bit, lowest bit first.
const FORMAT_BLOCK_WORDS: [usize; 4] = [7, 2, 3, 2];

/// One decoded detector event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Device clock ticks since the timestamp was last cleared
    pub timestamp: u64,
    /// Channel id as stored in the record header
    pub channel: u16,
    /// Peak height, present when format bit 0 is set
    pub peak: Option<u16>,
    /// Raw ADC samples, present when the record carries any
    pub waveform: Option<Vec<u16>>,
}

/// Pull-style source of events from a growing file.
pub trait EventDecoder: Send {
    /// Decode the next complete event.
    ///
    /// `Ok(None)` means no complete record is available yet; calling again after
    /// the file has grown continues where decoding stopped.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Decode`] for a corrupt record and [`DaqError::Io`] for
    /// read failures. Both are fatal for the stream.
    fn next_event(&mut self) -> AppResult<Option<Event>>;
}

/// Creates decoders for files opened by a parser worker.
pub trait DecoderFactory: Send + Sync {
    /// Wrap an opened file.
    fn open(&self, file: File) -> AppResult<Box<dyn EventDecoder>>;
}

/// Decoder for the SIS3316 record layout.
#[derive(Debug)]
pub struct Sis3316Decoder<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    offset: u64,
    maw_test_words: usize,
}

impl<R: Read> Sis3316Decoder<R> {
    /// Create a decoder. `maw_test_words` is the MAW test buffer length configured
    /// on the device; it is needed to skip records that carry one.
    pub fn new(reader: R, maw_test_words: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            offset: 0,
            maw_test_words,
        }
    }

    /// Read more bytes into the pending buffer. Returns zero at end of file.
    fn fill(&mut self) -> AppResult<usize> {
        if self.pos > 0 && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        let read = loop {
            match self.reader.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e.into());
                }
            }
        };
        self.buf.truncate(start + read);
        Ok(read)
    }

    /// Decode a record at the front of the pending bytes, returning it and its
    /// length in bytes, or `None` if it is incomplete.
    fn decode_front(&self) -> AppResult<Option<(Event, usize)>> {
        let bytes = &self.buf[self.pos..];
        let word = |i: usize| -> Option<u32> {
            let b = bytes.get(i * WORD..(i + 1) * WORD)?;
            Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };

        let (Some(w0), Some(w1)) = (word(0), word(1)) else {
            return Ok(None);
        };
        let format = w0 & 0xF;
        let channel = ((w0 >> 4) & 0xFFF) as u16;
        let timestamp = (u64::from(w0 >> 16) << 32) | u64::from(w1);

        let mut idx = 2;
        let mut peak = None;
        for (bit, words) in FORMAT_BLOCK_WORDS.iter().enumerate() {
            if format & (1 << bit) == 0 {
                continue;
            }
            if bit == 0 {
                let Some(first) = word(idx) else {
                    return Ok(None);
                };
                peak = Some((first & 0xFFFF) as u16);
            }
            idx += words;
        }

        let Some(trailer) = word(idx) else {
            return Ok(None);
        };
        if trailer >> 28 != TRAILER_MAGIC {
            return Err(DaqError::Decode(format!(
                "bad trailer word 0x{trailer:08x} in record at byte {}",
                self.offset
            )));
        }
        idx += 1;

        let raw_words = (trailer & RAW_WORDS_MASK) as usize;
        let raw_start = idx * WORD;
        idx += raw_words;
        if trailer & MAW_TEST_FLAG != 0 {
            idx += self.maw_test_words;
        }
        let len = idx * WORD;
        if bytes.len() < len {
            return Ok(None);
        }

        let waveform = (raw_words > 0).then(|| {
            bytes[raw_start..raw_start + raw_words * WORD]
                .chunks_exact(2)
                .map(|s| u16::from_le_bytes([s[0], s[1]]))
                .collect()
        });

        Ok(Some((
            Event {
                timestamp,
                channel,
                peak,
                waveform,
            },
            len,
        )))
    }
}

impl<R: Read + Send> EventDecoder for Sis3316Decoder<R> {
    fn next_event(&mut self) -> AppResult<Option<Event>> {
        loop {
            if let Some((event, len)) = self.decode_front()? {
                self.pos += len;
                self.offset += len as u64;
                return Ok(Some(event));
            }
            if self.fill()? == 0 {
                return Ok(None);
            }
        }
    }
}

/// Opens [`Sis3316Decoder`]s.
#[derive(Debug, Clone, Default)]
pub struct Sis3316DecoderFactory {
    /// MAW test buffer length in words
    pub maw_test_words: usize,
}

impl Sis3316DecoderFactory {
    /// Factory for decoders that skip `maw_test_words` words of MAW test data.
    pub fn new(maw_test_words: usize) -> Self {
        Self { maw_test_words }
    }
}

impl DecoderFactory for Sis3316DecoderFactory {
    fn open(&self, file: File) -> AppResult<Box<dyn EventDecoder>> {
        Ok(Box::new(Sis3316Decoder::new(file, self.maw_test_words)))
    }
}

/// Encode an event in the SIS3316 layout.
///
/// Only the peak block and raw samples are written. An odd number of samples is
/// padded with a zero sample. Timestamps are truncated to 48 bits and channel ids
/// to 12 bits.
pub fn encode_event(event: &Event) -> Vec<u8> {
    let samples = event.waveform.as_deref().unwrap_or_default();
    let raw_words = samples.len().div_ceil(2);
    let format = u32::from(event.peak.is_some());

    let mut words = Vec::with_capacity(3 + FORMAT_BLOCK_WORDS[0] + raw_words);
    words.push(
        format
            | (u32::from(event.channel & 0xFFF) << 4)
            | (((event.timestamp >> 32) as u32 & 0xFFFF) << 16),
    );
    words.push(event.timestamp as u32);
    if let Some(peak) = event.peak {
        words.push(u32::from(peak));
        words.extend(std::iter::repeat(0).take(FORMAT_BLOCK_WORDS[0] - 1));
    }
    words.push((TRAILER_MAGIC << 28) | (raw_words as u32 & RAW_WORDS_MASK));
    for pair in samples.chunks(2) {
        let low = u32::from(pair[0]);
        let high = pair.get(1).copied().map_or(0, u32::from);
        words.push(low | (high << 16));
    }

    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Seek, SeekFrom, Write};

    fn peak_event(timestamp: u64, peak: u16) -> Event {
        Event {
            timestamp,
            channel: 3,
            peak: Some(peak),
            waveform: None,
        }
    }

    #[test]
    fn test_decode_sequence() {
        let events = vec![
            peak_event(10, 512),
            Event {
                timestamp: 0x0001_2345_6789,
                channel: 0xABC,
                peak: None,
                waveform: Some(vec![1, 2, 3, 4]),
            },
            peak_event(250_000_000, 16383),
        ];
        let bytes: Vec<u8> = events.iter().flat_map(encode_event).collect();

        let mut decoder = Sis3316Decoder::new(Cursor::new(bytes.clone()), 0);
        for expected in &events {
            assert_eq!(decoder.next_event().unwrap().as_ref(), Some(expected));
        }
        assert_eq!(decoder.next_event().unwrap(), None);
        assert_eq!(decoder.offset, bytes.len() as u64);
    }

    #[test]
    fn test_odd_waveform_is_padded() {
        let event = Event {
            timestamp: 1,
            channel: 0,
            peak: None,
            waveform: Some(vec![7, 8, 9]),
        };
        let mut decoder = Sis3316Decoder::new(Cursor::new(encode_event(&event)), 0);
        let decoded = decoder.next_event().unwrap().unwrap();
        assert_eq!(decoded.waveform, Some(vec![7, 8, 9, 0]));
    }

    #[test]
    fn test_record_split_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch00.dat");
        let mut writer = File::create(&path).unwrap();
        let reader = File::open(&path).unwrap();
        let mut decoder = Sis3316Decoder::new(reader, 0);

        let first = encode_event(&peak_event(1, 100));
        let second = encode_event(&peak_event(2, 200));
        writer.write_all(&first).unwrap();
        writer.write_all(&second[..13]).unwrap();
        writer.flush().unwrap();

        assert_eq!(decoder.next_event().unwrap(), Some(peak_event(1, 100)));
        assert_eq!(decoder.next_event().unwrap(), None);

        writer.write_all(&second[13..]).unwrap();
        writer.flush().unwrap();
        assert_eq!(decoder.next_event().unwrap(), Some(peak_event(2, 200)));
        assert_eq!(decoder.next_event().unwrap(), None);
    }

    #[test]
    fn test_maw_test_buffer_is_skipped() {
        let mut record = encode_event(&peak_event(5, 42));
        // Set the MAW test flag on the trailer and append the buffer
        let trailer_at = 9 * WORD;
        let mut trailer = u32::from_le_bytes(record[trailer_at..trailer_at + 4].try_into().unwrap());
        trailer |= MAW_TEST_FLAG;
        record[trailer_at..trailer_at + 4].copy_from_slice(&trailer.to_le_bytes());
        record.extend(std::iter::repeat(0xFF).take(3 * WORD));
        record.extend(encode_event(&peak_event(6, 43)));

        let mut decoder = Sis3316Decoder::new(Cursor::new(record), 3);
        assert_eq!(decoder.next_event().unwrap(), Some(peak_event(5, 42)));
        assert_eq!(decoder.next_event().unwrap(), Some(peak_event(6, 43)));
    }

    #[test]
    fn test_bad_trailer_is_fatal() {
        let mut bytes = encode_event(&Event {
            timestamp: 1,
            channel: 0,
            peak: None,
            waveform: None,
        });
        bytes[11] = 0x00;
        let mut decoder = Sis3316Decoder::new(Cursor::new(bytes), 0);
        assert!(matches!(decoder.next_event(), Err(DaqError::Decode(_))));
    }

    #[test]
    fn test_factory_opens_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&encode_event(&peak_event(9, 9))).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut decoder = Sis3316DecoderFactory::new(0).open(file).unwrap();
        assert_eq!(decoder.next_event().unwrap(), Some(peak_event(9, 9)));
    }
}
