pub mod ata;
pub mod keyboard;
pub mod timer;

pub fn init() {
    timer::init();
    keyboard::init();
    ata::init();
}
