pub mod aes;
pub mod rsm;

/// Hamming weight of every byte value.
pub static HW: [u8; 256] = hw_table();

const fn hw_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() as u8;
        i += 1;
    }
    table
}

/// Returns the Hamming weight of `value`.
pub fn hw(value: u8) -> u8 {
    HW[value as usize]
}
