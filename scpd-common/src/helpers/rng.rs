use rand_chacha::ChaCha20Rng;

pub fn get_crypto_rng() -> ChaCha20Rng {
    rand::make_rng()
}
