fn main() {
    // Only ESP-IDF builds need the esp-idf-sys link environment propagated
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
