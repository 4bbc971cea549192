fn main() {
    pen_clicks_lib::run()
}
